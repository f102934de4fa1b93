use crate::error::{Error, Result};
use gimli::{AttributeValue, LittleEndian, Reader as _};
use object::{Object, ObjectSection};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

type Reader = gimli::EndianRcSlice<LittleEndian>;

/// A function extracted from a `DW_TAG_subprogram` entry. The range
/// `[low_pc, high_pc)` covers every instruction of the function.
pub struct Function {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
    pub decl_file: u64,
    pub external: bool,
    pub cu: usize,
}

pub struct CompileUnit {
    pub name: String,
    pub functions: Vec<usize>,
}

struct LineAddress {
    pc: u64,
    file: String,
    line: u64,
}

/// Debug index built once from the target's DWARF and immutable afterwards.
///
/// `sources` maps `file -> line -> pc`, keeping the first address the line
/// program emitted for each pair. `line_table` holds the same entries sorted
/// by pc, so reverse lookups are a binary search instead of a full scan.
pub struct DebugIndex {
    sources: HashMap<String, HashMap<u64, u64>>,
    line_table: Vec<LineAddress>,
    functions: Vec<Function>,
    compile_units: Vec<CompileUnit>,
}

/// Splits `"filename:lineno"` into its parts.
pub fn parse_location(loc: &str) -> Result<(String, u64)> {
    let parts: Vec<&str> = loc.split(':').collect();
    let [filename, lineno] = parts.as_slice() else {
        return Err(Error::BadLocation);
    };
    let lineno: u64 = lineno.parse().map_err(|_| Error::BadLocation)?;
    Ok((filename.to_string(), lineno))
}

impl DebugIndex {
    /// Reads the executable at `path` and indexes its line table and
    /// functions. The file is not kept open afterwards.
    pub fn build(path: &Path) -> Result<Self> {
        let buffer = fs::read(path)?;
        let obj_file = object::File::parse(buffer.as_slice())?;

        for (label, name) in [("info", ".debug_info"), ("line", ".debug_line")] {
            if section_data(&obj_file, name).is_none() {
                return Err(Error::MissingDebugSection(label));
            }
        }

        let dwarf = gimli::Dwarf::load(|id| -> std::result::Result<Reader, gimli::Error> {
            let data = section_data(&obj_file, id.name()).unwrap_or_default();
            Ok(gimli::EndianRcSlice::new(Rc::from(&*data), LittleEndian))
        })?;

        let mut index = DebugIndex {
            sources: HashMap::new(),
            line_table: Vec::new(),
            functions: Vec::new(),
            compile_units: Vec::new(),
        };
        index.walk_units(&dwarf)?;

        index.line_table = index
            .sources
            .iter()
            .flat_map(|(file, lines)| {
                lines.iter().map(|(&line, &pc)| LineAddress {
                    pc,
                    file: file.clone(),
                    line,
                })
            })
            .collect();
        index
            .line_table
            .sort_by(|a, b| (a.pc, &a.file, a.line).cmp(&(b.pc, &b.file, b.line)));

        log::debug!(
            "indexed {} compile units, {} functions, {} line addresses",
            index.compile_units.len(),
            index.functions.len(),
            index.line_table.len()
        );
        Ok(index)
    }

    fn walk_units(&mut self, dwarf: &gimli::Dwarf<Reader>) -> Result<()> {
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header.clone())?;
            let mut entries = unit.entries();

            while let Some((_, entry)) = entries.next_dfs()? {
                match entry.tag() {
                    gimli::constants::DW_TAG_compile_unit => {
                        let name = unit
                            .name
                            .clone()
                            .and_then(|r| r.to_string_lossy().ok().map(|s| s.into_owned()))
                            .unwrap_or_default();
                        log::debug!("indexing compile unit {name:?}");
                        self.compile_units.push(CompileUnit {
                            name,
                            functions: Vec::new(),
                        });

                        if let Some(offset) = line_program_offset(entry) {
                            let program = dwarf.debug_line.program(
                                offset,
                                header.address_size(),
                                unit.comp_dir.clone(),
                                unit.name.clone(),
                            )?;
                            self.drain_line_program(dwarf, &unit, program)?;
                        }
                    }
                    gimli::constants::DW_TAG_subprogram => {
                        self.record_subprogram(dwarf, &unit, entry)?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn drain_line_program(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        unit: &gimli::Unit<Reader>,
        program: gimli::IncompleteLineProgram<Reader>,
    ) -> Result<()> {
        let (program, sequences) = program.sequences()?;
        for sequence in sequences {
            let mut rows = program.resume_from(&sequence);
            while let Some((_, row)) = rows.next_row()? {
                // End-of-sequence markers carry no file.
                if row.end_sequence() {
                    continue;
                }
                let Some(line) = row.line() else { continue };
                // Address zero encodes "absent" in the index.
                if row.address() == 0 {
                    continue;
                }
                let Some(file) = row_file_path(dwarf, unit, &program, row.file_index()) else {
                    continue;
                };
                // Only the first address emitted for a (file, line) pair is kept.
                self.sources
                    .entry(file)
                    .or_default()
                    .entry(line.get())
                    .or_insert(row.address());
            }
        }
        Ok(())
    }

    fn record_subprogram(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        unit: &gimli::Unit<Reader>,
        entry: &gimli::DebuggingInformationEntry<'_, '_, Reader, usize>,
    ) -> Result<()> {
        let mut name = String::new();
        let mut low_pc = 0u64;
        let mut high_pc_attr = None;
        let mut decl_file = 0u64;
        let mut external = false;

        let mut attrs = entry.attrs();
        while let Some(attr) = attrs.next()? {
            match attr.name() {
                gimli::constants::DW_AT_name => {
                    if let Some(s) = attr_string(dwarf, unit, attr.value()) {
                        name = s;
                    }
                }
                gimli::constants::DW_AT_low_pc => {
                    if let AttributeValue::Addr(addr) = attr.value() {
                        low_pc = addr;
                    }
                }
                gimli::constants::DW_AT_high_pc => high_pc_attr = Some(attr.value()),
                gimli::constants::DW_AT_decl_file => {
                    if let Some(val) = attr.udata_value() {
                        decl_file = val;
                    }
                }
                gimli::constants::DW_AT_external => {
                    if let AttributeValue::Flag(flag) = attr.value() {
                        external = flag;
                    }
                }
                _ => {}
            }
        }

        let high_pc = match high_pc_attr {
            Some(AttributeValue::Addr(addr)) => addr,
            // Constant class means an offset from low_pc.
            Some(other) => low_pc + other.udata_value().unwrap_or(0),
            None => 0,
        };

        if low_pc == 0 || high_pc <= low_pc {
            // Declarations and abstract instances carry no code range.
            log::debug!("skipping rangeless subprogram {name:?}");
            return Ok(());
        }

        let cu = self.compile_units.len().saturating_sub(1);
        let index = self.functions.len();
        self.functions.push(Function {
            name,
            low_pc,
            high_pc,
            decl_file,
            external,
            cu,
        });
        if let Some(unit) = self.compile_units.last_mut() {
            unit.functions.push(index);
        }
        Ok(())
    }

    /// Resolves a `"filename:lineno"` location to the line's address.
    pub fn loc_to_pc(&self, loc: &str) -> Result<u64> {
        let (filename, lineno) = parse_location(loc)?;
        self.file_line_to_pc(&filename, lineno)
    }

    /// Returns the first address the line program emitted for the line.
    /// The filename may be a full path as recorded in the debug info, or
    /// any suffix of one on a path-component boundary.
    pub fn file_line_to_pc(&self, filename: &str, lineno: u64) -> Result<u64> {
        if let Some(&pc) = self.sources.get(filename).and_then(|m| m.get(&lineno)) {
            return Ok(pc);
        }
        let mut candidates: Vec<&String> = self
            .sources
            .keys()
            .filter(|known| {
                known
                    .strip_suffix(filename)
                    .is_some_and(|rest| rest.ends_with('/'))
            })
            .collect();
        candidates.sort();
        for known in candidates {
            if let Some(&pc) = self.sources[known].get(&lineno) {
                return Ok(pc);
            }
        }
        Err(Error::NotFoundSourceLine(filename.to_string(), lineno))
    }

    /// Maps an address back to a source line. Exact matches win; otherwise
    /// the nearest line address is returned, ties going to the higher one.
    pub fn pc_to_file_line(&self, pc: u64) -> Result<(String, u64)> {
        let first_above = self.line_table.partition_point(|entry| entry.pc < pc);
        let exact_or_above = self.line_table.get(first_above);
        if let Some(entry) = exact_or_above {
            if entry.pc == pc {
                return Ok((entry.file.clone(), entry.line));
            }
        }
        let below = first_above
            .checked_sub(1)
            .and_then(|i| self.line_table.get(i));
        let entry = match (below, exact_or_above) {
            (Some(lo), Some(hi)) if (hi.pc - pc) > (pc - lo.pc) => lo,
            (_, Some(hi)) => hi,
            (Some(lo), None) => lo,
            (None, None) => return Err(Error::InvalidPc(pc)),
        };
        Ok((entry.file.clone(), entry.line))
    }

    /// Lowest text address the line table knows about.
    pub fn first_line_address(&self) -> Option<u64> {
        self.line_table.first().map(|entry| entry.pc)
    }

    /// First function whose `[low_pc, high_pc)` range contains `pc`.
    pub fn find_function_including_pc(&self, pc: u64) -> Result<&Function> {
        self.functions
            .iter()
            .find(|f| f.low_pc <= pc && pc < f.high_pc)
            .ok_or(Error::NotFoundFunction(pc))
    }

    /// Line addresses falling inside `[low, high)`, sorted by pc.
    pub fn line_addresses_in_range(&self, low: u64, high: u64) -> Vec<(u64, u64)> {
        let start = self.line_table.partition_point(|entry| entry.pc < low);
        self.line_table[start..]
            .iter()
            .take_while(|entry| entry.pc < high)
            .map(|entry| (entry.pc, entry.line))
            .collect()
    }
}

#[cfg(test)]
impl DebugIndex {
    pub(crate) fn find_function_by_name(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Copy of the index with every address shifted by `slide`. Lets tests
    /// line a link-time table up with a relocated image.
    pub(crate) fn relocated(&self, slide: u64) -> DebugIndex {
        DebugIndex {
            sources: self
                .sources
                .iter()
                .map(|(file, lines)| {
                    let lines = lines
                        .iter()
                        .map(|(&line, &pc)| (line, pc.wrapping_add(slide)))
                        .collect();
                    (file.clone(), lines)
                })
                .collect(),
            line_table: self
                .line_table
                .iter()
                .map(|entry| LineAddress {
                    pc: entry.pc.wrapping_add(slide),
                    file: entry.file.clone(),
                    line: entry.line,
                })
                .collect(),
            functions: self
                .functions
                .iter()
                .map(|f| Function {
                    name: f.name.clone(),
                    low_pc: f.low_pc.wrapping_add(slide),
                    high_pc: f.high_pc.wrapping_add(slide),
                    decl_file: f.decl_file,
                    external: f.external,
                    cu: f.cu,
                })
                .collect(),
            compile_units: self
                .compile_units
                .iter()
                .map(|cu| CompileUnit {
                    name: cu.name.clone(),
                    functions: cu.functions.clone(),
                })
                .collect(),
        }
    }
}

fn section_data<'a>(
    obj_file: &'a object::File<'a>,
    name: &str,
) -> Option<std::borrow::Cow<'a, [u8]>> {
    let compressed = format!(".z{}", &name[1..]);
    let section = obj_file
        .section_by_name(name)
        .or_else(|| obj_file.section_by_name(&compressed))?;
    section.uncompressed_data().ok()
}

fn line_program_offset(
    entry: &gimli::DebuggingInformationEntry<'_, '_, Reader, usize>,
) -> Option<gimli::DebugLineOffset<usize>> {
    if let AttributeValue::DebugLineRef(offset) =
        entry.attr(gimli::constants::DW_AT_stmt_list).ok()??.value()
    {
        return Some(offset);
    }
    None
}

fn attr_string(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    value: AttributeValue<Reader>,
) -> Option<String> {
    dwarf
        .attr_string(unit, value)
        .ok()?
        .to_string_lossy()
        .ok()
        .map(|s| s.into_owned())
}

/// Renders a line-table file entry as the path the line program describes:
/// the include directory joined with the file name, resolved against the
/// unit's compilation directory when relative.
fn row_file_path(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    program: &gimli::CompleteLineProgram<Reader>,
    file_index: u64,
) -> Option<String> {
    let header = program.header();
    let file = header.file(file_index)?;

    let file_name = PathBuf::from(attr_string(dwarf, unit, file.path_name())?);
    if file_name.is_absolute() {
        return Some(file_name.display().to_string());
    }

    let comp_dir = unit
        .comp_dir
        .clone()
        .and_then(|r| r.to_string_lossy().ok().map(|s| PathBuf::from(s.into_owned())));
    let mut dir = match file
        .directory(header)
        .and_then(|value| attr_string(dwarf, unit, value))
        .map(PathBuf::from)
    {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => match comp_dir {
            Some(comp_dir) => comp_dir.join(dir),
            None => dir,
        },
        None => comp_dir.unwrap_or_default(),
    };
    dir.push(file_name);
    Some(dir.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(entries: &[(&str, u64, u64)], functions: Vec<Function>) -> DebugIndex {
        let mut sources: HashMap<String, HashMap<u64, u64>> = HashMap::new();
        for &(file, line, pc) in entries {
            sources
                .entry(file.to_string())
                .or_default()
                .entry(line)
                .or_insert(pc);
        }
        let mut line_table: Vec<LineAddress> = entries
            .iter()
            .map(|&(file, line, pc)| LineAddress {
                pc,
                file: file.to_string(),
                line,
            })
            .collect();
        line_table.sort_by(|a, b| (a.pc, &a.file, a.line).cmp(&(b.pc, &b.file, b.line)));
        DebugIndex {
            sources,
            line_table,
            functions,
            compile_units: vec![],
        }
    }

    fn func(name: &str, low_pc: u64, high_pc: u64) -> Function {
        Function {
            name: name.to_string(),
            low_pc,
            high_pc,
            decl_file: 0,
            external: false,
            cu: 0,
        }
    }

    #[test]
    fn location_parsing() {
        assert_eq!(parse_location("main.c:10").unwrap(), ("main.c".into(), 10));
        assert!(matches!(parse_location("main.c"), Err(Error::BadLocation)));
        assert!(matches!(
            parse_location("main.c:ten"),
            Err(Error::BadLocation)
        ));
        assert!(matches!(parse_location("a:b:10"), Err(Error::BadLocation)));
    }

    #[test]
    fn exact_lookups_round_trip() {
        let idx = index(
            &[
                ("/src/a.c", 1, 0x100),
                ("/src/a.c", 2, 0x200),
                ("/src/b.c", 7, 0x180),
            ],
            vec![],
        );
        for (file, line, pc) in [
            ("/src/a.c", 1, 0x100),
            ("/src/a.c", 2, 0x200),
            ("/src/b.c", 7, 0x180),
        ] {
            assert_eq!(idx.file_line_to_pc(file, line).unwrap(), pc);
            assert_eq!(idx.pc_to_file_line(pc).unwrap(), (file.to_string(), line));
        }
    }

    #[test]
    fn nearest_line_address_wins_with_ties_to_higher() {
        let idx = index(&[("a.c", 1, 100), ("a.c", 2, 200)], vec![]);
        assert_eq!(idx.pc_to_file_line(140).unwrap(), ("a.c".into(), 1));
        assert_eq!(idx.pc_to_file_line(160).unwrap(), ("a.c".into(), 2));
        assert_eq!(idx.pc_to_file_line(150).unwrap(), ("a.c".into(), 2));
    }

    #[test]
    fn out_of_range_addresses_clamp_to_nearest_end() {
        let idx = index(&[("a.c", 1, 100), ("a.c", 2, 200)], vec![]);
        assert_eq!(idx.pc_to_file_line(5).unwrap(), ("a.c".into(), 1));
        assert_eq!(idx.pc_to_file_line(5000).unwrap(), ("a.c".into(), 2));
    }

    #[test]
    fn empty_index_rejects_every_pc() {
        let idx = index(&[], vec![]);
        assert!(matches!(
            idx.pc_to_file_line(0x42),
            Err(Error::InvalidPc(0x42))
        ));
    }

    #[test]
    fn file_suffix_matching() {
        let idx = index(&[("/home/u/src/main.c", 10, 0x400)], vec![]);
        assert_eq!(idx.file_line_to_pc("main.c", 10).unwrap(), 0x400);
        assert_eq!(idx.file_line_to_pc("src/main.c", 10).unwrap(), 0x400);
        // "ain.c" is not a whole path component.
        assert!(matches!(
            idx.file_line_to_pc("ain.c", 10),
            Err(Error::NotFoundSourceLine(_, 10))
        ));
        assert!(matches!(
            idx.file_line_to_pc("main.c", 11),
            Err(Error::NotFoundSourceLine(_, 11))
        ));
    }

    #[test]
    fn function_containment() {
        let idx = index(
            &[],
            vec![func("foo", 0x500, 0x5a0), func("bar", 0x5a0, 0x600)],
        );
        assert_eq!(idx.find_function_including_pc(0x500).unwrap().name, "foo");
        assert_eq!(idx.find_function_including_pc(0x59f).unwrap().name, "foo");
        assert_eq!(idx.find_function_including_pc(0x5a0).unwrap().name, "bar");
        assert!(matches!(
            idx.find_function_including_pc(0x700),
            Err(Error::NotFoundFunction(0x700))
        ));
    }

    #[test]
    fn line_addresses_within_function_range() {
        let idx = index(
            &[("a.c", 1, 0x500), ("a.c", 2, 0x520), ("a.c", 3, 0x5a0)],
            vec![],
        );
        assert_eq!(
            idx.line_addresses_in_range(0x500, 0x5a0),
            vec![(0x500, 1), (0x520, 2)]
        );
        assert_eq!(
            idx.line_addresses_in_range(0x501, 0x520),
            Vec::<(u64, u64)>::new()
        );
    }
}
