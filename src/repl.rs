use std::collections::HashMap;

use reedline::{
    ColumnarMenu, Completer, Emacs, KeyCode, KeyModifiers, MenuBuilder, Reedline, ReedlineEvent,
    ReedlineMenu, Signal, Suggestion, default_emacs_keybindings,
};

type Action<T> = fn(&clap::ArgMatches, &mut T) -> anyhow::Result<String>;

/// The REPL consults the command context after every command; a handler
/// flips the flag to end the session.
pub trait ReplContext {
    fn should_exit(&self) -> bool;
}

struct Command<T> {
    clap_representation: clap::Command,
    action: Action<T>,
}

pub struct Repl<T> {
    context: T,
    commands: HashMap<String, Command<T>>,
}

impl<T: ReplContext> Repl<T> {
    pub fn new(context: T) -> Self {
        Self {
            context,
            commands: HashMap::default(),
        }
    }

    pub fn add_command(mut self, command: clap::Command, action: Action<T>) -> Self {
        self.commands.insert(
            command.get_name().to_string(),
            Command {
                clap_representation: command.disable_help_flag(true),
                action,
            },
        );
        self
    }

    fn get_help(&self) -> String {
        let mut command = clap::Command::new("rdbg");
        for subcommand in self.commands.values() {
            command = command.subcommand(subcommand.clap_representation.clone());
        }
        command = command.override_usage("[COMMAND] [ARGS]");
        command = command.disable_help_flag(true);
        command.render_help().to_string()
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        let completer = Box::new(CommandCompleter::new(&self.commands));
        // Tab opens the completion menu and cycles through it.
        let completion_menu = Box::new(ColumnarMenu::default().with_name("completion_menu"));
        let mut keybindings = default_emacs_keybindings();
        keybindings.add_binding(
            KeyModifiers::NONE,
            KeyCode::Tab,
            ReedlineEvent::UntilFound(vec![
                ReedlineEvent::Menu("completion_menu".to_string()),
                ReedlineEvent::MenuNext,
            ]),
        );

        let edit_mode = Box::new(Emacs::new(keybindings));

        let mut line_editor = Reedline::create()
            .with_completer(completer)
            .with_menu(ReedlineMenu::EngineCompleter(completion_menu))
            .with_edit_mode(edit_mode);
        let prompt = DebuggerPrompt {};
        loop {
            let signal = line_editor.read_line(&prompt)?;
            match signal {
                Signal::Success(buffer) => self.run_command(buffer),
                Signal::CtrlD | Signal::CtrlC => {
                    println!("\nAborted!");
                    return Ok(());
                }
            }
            if self.context.should_exit() {
                return Ok(());
            }
        }
    }

    fn run_command(&mut self, buffer: String) {
        if buffer.trim().is_empty() {
            return;
        }
        let parser = clap::Command::new("rdbg")
            .subcommands(
                self.commands
                    .values()
                    .map(|v| v.clap_representation.clone())
                    .collect::<Vec<clap::Command>>(),
            )
            .no_binary_name(true);
        match parser.try_get_matches_from(buffer.split_whitespace()) {
            Ok(matches) => {
                if let Some((command_name, args)) = matches.subcommand() {
                    let command = self.commands.get_mut(command_name).unwrap();
                    match (command.action)(args, &mut self.context) {
                        Ok(message) => println!("{}\n", message),
                        Err(err) => println!("error: {err:#}\n"),
                    }
                }
            }
            Err(_) => println!("{}", self.get_help()),
        }
    }
}

struct CommandCompleter {
    commands: Vec<String>,
}

impl CommandCompleter {
    fn new<T>(commands: &HashMap<String, Command<T>>) -> Self {
        let mut names: Vec<String> = commands
            .values()
            .flat_map(|command| {
                let command = &command.clap_representation;
                std::iter::once(command.get_name().to_string())
                    .chain(command.get_all_aliases().map(str::to_string))
            })
            .collect();
        names.sort();
        Self { commands: names }
    }
}

impl Completer for CommandCompleter {
    fn complete(&mut self, line: &str, pos: usize) -> Vec<Suggestion> {
        self.commands
            .iter()
            .filter(|command| command.starts_with(line))
            .map(|command| Suggestion {
                value: command.to_string(),
                description: None,
                style: None,
                extra: None,
                span: reedline::Span { start: 0, end: pos },
                append_whitespace: true,
            })
            .collect()
    }
}

struct DebuggerPrompt {}

impl reedline::Prompt for DebuggerPrompt {
    fn render_prompt_left(&self) -> std::borrow::Cow<str> {
        std::borrow::Cow::Borrowed("")
    }

    fn render_prompt_right(&self) -> std::borrow::Cow<str> {
        std::borrow::Cow::Borrowed("")
    }

    fn render_prompt_indicator(
        &self,
        _prompt_mode: reedline::PromptEditMode,
    ) -> std::borrow::Cow<str> {
        std::borrow::Cow::Borrowed("(rdbg) ")
    }

    fn render_prompt_multiline_indicator(&self) -> std::borrow::Cow<str> {
        std::borrow::Cow::Borrowed(">>")
    }

    fn render_prompt_history_search_indicator(
        &self,
        _history_search: reedline::PromptHistorySearch,
    ) -> std::borrow::Cow<str> {
        std::borrow::Cow::Borrowed("Search>")
    }
}
