use crate::error::{Error, Result};
use crate::inferior::{INT3, Inferior};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakpointKind {
    /// Set by a user command, survives across stops and restarts.
    User,
    /// Installed by the controller to implement stepping, removed before
    /// the installing command returns.
    Internal,
}

/// One installed breakpoint. `saved_byte` is the text byte displaced by
/// the trap instruction and is captured once, at install time.
pub struct Breakpoint {
    pub pc: u64,
    pub file: String,
    pub line: u64,
    pub saved_byte: u8,
    pub kind: BreakpointKind,
    pub enabled: bool,
}

/// All live breakpoints, in insertion order, with unique addresses across
/// both kinds.
#[derive(Default)]
pub struct BreakpointTable {
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointTable {
    pub fn find(&self, pc: u64) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|b| b.pc == pc)
    }

    /// Installs a user breakpoint at a resolved source location: captures
    /// the displaced byte, writes the trap instruction, records it.
    pub fn set_user_breakpoint(
        &mut self,
        inferior: &Inferior,
        pc: u64,
        file: String,
        line: u64,
    ) -> Result<&Breakpoint> {
        self.check_free(pc)?;
        let saved_byte = inferior.write_byte(pc, INT3)?;
        self.breakpoints.push(Breakpoint {
            pc,
            file,
            line,
            saved_byte,
            kind: BreakpointKind::User,
            enabled: true,
        });
        Ok(self.breakpoints.last().unwrap())
    }

    /// Installs an internal breakpoint directly by address. A duplicate
    /// address is `AlreadyExists`, which callers treat as benign.
    pub fn set_internal_breakpoint(&mut self, inferior: &Inferior, pc: u64) -> Result<()> {
        self.check_free(pc)?;
        let saved_byte = inferior.write_byte(pc, INT3)?;
        self.breakpoints.push(Breakpoint {
            pc,
            file: String::new(),
            line: 0,
            saved_byte,
            kind: BreakpointKind::Internal,
            enabled: true,
        });
        Ok(())
    }

    /// Restores the displaced byte. Idempotent on disabled breakpoints.
    pub fn disable(&mut self, inferior: &Inferior, pc: u64) -> Result<()> {
        let bp = self.find_mut(pc)?;
        if !bp.enabled {
            return Ok(());
        }
        inferior.write_byte(bp.pc, bp.saved_byte)?;
        bp.enabled = false;
        Ok(())
    }

    /// Writes the trap instruction back. The displaced byte captured at
    /// install time is left untouched.
    pub fn enable(&mut self, inferior: &Inferior, pc: u64) -> Result<()> {
        let bp = self.find_mut(pc)?;
        inferior.write_byte(bp.pc, INT3)?;
        bp.enabled = true;
        Ok(())
    }

    /// Drops an internal record. The breakpoint must already be disabled.
    pub fn clear_internal(&mut self, pc: u64) {
        self.breakpoints
            .retain(|b| b.kind != BreakpointKind::Internal || b.pc != pc);
    }

    pub fn user_breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints
            .iter()
            .filter(|b| b.kind == BreakpointKind::User)
    }

    pub fn all(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Removes the `ordinal`-th user breakpoint (1-based, insertion
    /// order), restoring its byte when the inferior is still alive.
    /// Returns `None` when no user breakpoint has that ordinal.
    pub fn remove_user(
        &mut self,
        inferior: Option<&Inferior>,
        ordinal: usize,
    ) -> Result<Option<Breakpoint>> {
        let Some(position) = self
            .breakpoints
            .iter()
            .enumerate()
            .filter(|(_, b)| b.kind == BreakpointKind::User)
            .map(|(i, _)| i)
            .nth(ordinal.wrapping_sub(1))
        else {
            return Ok(None);
        };
        if let Some(inferior) = inferior {
            let pc = self.breakpoints[position].pc;
            self.disable(inferior, pc)?;
        }
        Ok(Some(self.breakpoints.remove(position)))
    }

    /// Removes every user breakpoint, returning how many were dropped.
    pub fn remove_all_user(&mut self, inferior: Option<&Inferior>) -> Result<usize> {
        let mut removed = 0;
        while self.remove_user(inferior, 1)?.is_some() {
            removed += 1;
        }
        Ok(removed)
    }

    /// Rewrites the trap instruction at every user breakpoint after the
    /// inferior has been re-execed. The fresh text image holds the same
    /// original bytes, so the saved bytes stay valid. Stale internal
    /// records are dropped.
    pub fn reinstall(&mut self, inferior: &Inferior) -> Result<()> {
        self.breakpoints
            .retain(|b| b.kind == BreakpointKind::User);
        for bp in &mut self.breakpoints {
            inferior.write_byte(bp.pc, INT3)?;
            bp.enabled = true;
        }
        Ok(())
    }

    fn check_free(&self, pc: u64) -> Result<()> {
        if self.find(pc).is_some() {
            return Err(Error::AlreadyExists(pc));
        }
        Ok(())
    }

    fn find_mut(&mut self, pc: u64) -> Result<&mut Breakpoint> {
        self.breakpoints
            .iter_mut()
            .find(|b| b.pc == pc)
            .ok_or(Error::InvalidPc(pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pc: u64, kind: BreakpointKind) -> Breakpoint {
        Breakpoint {
            pc,
            file: String::new(),
            line: 0,
            saved_byte: 0x55,
            kind,
            enabled: true,
        }
    }

    fn table(records: Vec<Breakpoint>) -> BreakpointTable {
        BreakpointTable {
            breakpoints: records,
        }
    }

    #[test]
    fn addresses_are_unique_across_kinds() {
        let tbl = table(vec![record(0x100, BreakpointKind::User)]);
        assert!(matches!(tbl.check_free(0x100), Err(Error::AlreadyExists(0x100))));
        assert!(tbl.check_free(0x101).is_ok());
    }

    #[test]
    fn user_ordinals_skip_internal_records() {
        let tbl = table(vec![
            record(0x100, BreakpointKind::User),
            record(0x200, BreakpointKind::Internal),
            record(0x300, BreakpointKind::User),
        ]);
        let users: Vec<u64> = tbl.user_breakpoints().map(|b| b.pc).collect();
        assert_eq!(users, vec![0x100, 0x300]);

        let mut tbl = tbl;
        let removed = tbl.remove_user(None, 2).unwrap().unwrap();
        assert_eq!(removed.pc, 0x300);
        assert!(tbl.find(0x200).is_some());
        assert!(tbl.remove_user(None, 2).unwrap().is_none());
    }

    #[test]
    fn remove_all_user_keeps_internal_records() {
        let mut tbl = table(vec![
            record(0x100, BreakpointKind::User),
            record(0x200, BreakpointKind::Internal),
            record(0x300, BreakpointKind::User),
        ]);
        assert_eq!(tbl.remove_all_user(None).unwrap(), 2);
        assert!(tbl.find(0x100).is_none());
        assert!(tbl.find(0x200).is_some());
    }

    #[test]
    fn clear_internal_leaves_user_breakpoints_alone() {
        let mut tbl = table(vec![
            record(0x100, BreakpointKind::User),
            record(0x100 + 8, BreakpointKind::Internal),
        ]);
        tbl.clear_internal(0x100);
        assert!(tbl.find(0x100).is_some());
        tbl.clear_internal(0x108);
        assert!(tbl.find(0x108).is_none());
    }

    #[test]
    fn toggles_preserve_the_displaced_byte() {
        let Some(inferior) = crate::inferior::tests::launch_self() else {
            return;
        };
        let pc = inferior.get_pc().unwrap();
        let original = inferior.read_byte(pc).unwrap();

        let mut tbl = BreakpointTable::default();
        tbl.set_user_breakpoint(&inferior, pc, "a.c".into(), 1)
            .unwrap();
        assert_eq!(tbl.find(pc).unwrap().saved_byte, original);
        assert_eq!(inferior.read_byte(pc).unwrap(), INT3);

        for _ in 0..3 {
            tbl.disable(&inferior, pc).unwrap();
            // idempotent on an already-disabled breakpoint
            tbl.disable(&inferior, pc).unwrap();
            assert_eq!(inferior.read_byte(pc).unwrap(), original);
            tbl.enable(&inferior, pc).unwrap();
            assert_eq!(inferior.read_byte(pc).unwrap(), INT3);
        }
        assert_eq!(tbl.find(pc).unwrap().saved_byte, original);

        assert!(matches!(
            tbl.set_internal_breakpoint(&inferior, pc),
            Err(Error::AlreadyExists(_))
        ));
        inferior.kill();
    }

    #[test]
    fn reinstall_rearms_user_breakpoints_in_a_fresh_image() {
        let Some(inferior) = crate::inferior::tests::launch_self() else {
            return;
        };
        let pc = inferior.get_pc().unwrap();
        let original = inferior.read_byte(pc).unwrap();

        let mut tbl = BreakpointTable::default();
        tbl.set_user_breakpoint(&inferior, pc, "a.c".into(), 1)
            .unwrap();
        tbl.set_internal_breakpoint(&inferior, pc + 8).unwrap();
        inferior.kill();

        let Some(fresh) = crate::inferior::tests::launch_self() else {
            return;
        };
        let fresh_pc = fresh.get_pc().unwrap();
        assert_eq!(fresh_pc, pc, "randomization is disabled at launch");
        tbl.reinstall(&fresh).unwrap();
        assert_eq!(fresh.read_byte(pc).unwrap(), INT3);
        assert_eq!(tbl.find(pc).unwrap().saved_byte, original);
        assert!(tbl.find(pc + 8).is_none(), "internal records are dropped");
        fresh.kill();
    }
}
