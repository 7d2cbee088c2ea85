//! The data space: every registered cell, in registration order.

use alloc::vec::Vec;

use crate::cell::DataCell;
use crate::error::{Error, RegisterError};
use crate::MAX_CELLS;

pub(crate) struct DataSpace {
    cells: Vec<DataCell>,
    /// Worst-case strobe data bytes: every cell enabled.
    pub data_max: usize,
    /// Strobe data bytes of the currently enabled cells.
    pub data_enabled: usize,
}

impl DataSpace {
    pub fn new() -> Self {
        Self {
            cells: Vec::new(),
            data_max: 0,
            data_enabled: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[DataCell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [DataCell] {
        &mut self.cells
    }

    pub fn get(&self, index: u8) -> Option<&DataCell> {
        self.cells.get(index as usize)
    }

    /// Append a cell. Permanent cells are forcibly enabled.
    pub fn register(&mut self, mut cell: DataCell) -> Result<u8, RegisterError> {
        if self.cells.len() >= MAX_CELLS {
            return Err(RegisterError::TooManyCells);
        }
        if cell.ty.permanent() {
            cell.ty.set_enabled(true);
        }
        let footprint = cell.footprint();
        self.data_max += footprint;
        if cell.ty.enabled() {
            self.data_enabled += footprint;
        }
        let index = self.cells.len() as u8;
        self.cells.push(cell);
        Ok(index)
    }

    /// Linear walk to a cell and its byte offset in the strobe data area.
    /// Only currently enabled cells ahead of the target contribute.
    pub fn seek(&self, index: u8) -> Option<(&DataCell, usize)> {
        let target = self.cells.get(index as usize)?;
        let offset = self.cells[..index as usize]
            .iter()
            .filter(|cell| cell.ty.enabled())
            .map(|cell| cell.footprint())
            .sum();
        Some((target, offset))
    }

    /// Flip a cell's strobe membership, keeping the enabled-bytes account.
    pub fn set_enabled(&mut self, index: u8, enabled: bool) -> Result<(), Error> {
        let cell = self
            .cells
            .get_mut(index as usize)
            .ok_or(Error::BadAddress)?;
        if !enabled && cell.ty.permanent() {
            return Err(Error::PermissionDenied);
        }
        if cell.ty.enabled() == enabled {
            return Ok(());
        }
        cell.ty.set_enabled(enabled);
        let footprint = cell.footprint();
        if enabled {
            self.data_enabled += footprint;
        } else {
            self.data_enabled -= footprint;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellKind, CellType, UpdateRate};

    fn cell(kind: CellKind, width: u8, count: u16, enabled: bool) -> DataCell {
        let mut ty = CellType::new(kind, width);
        ty.set_enabled(enabled);
        DataCell {
            ty,
            count,
            ptr: None,
            name: "cell",
            unit: "",
            on_change: None,
            rate: UpdateRate::default(),
        }
    }

    #[test]
    fn registration_is_monotonic() {
        let mut space = DataSpace::new();
        for i in 0..5 {
            let index = space.register(cell(CellKind::Uint, 2, 1, true)).unwrap();
            assert_eq!(i, index);
            assert_eq!(i as usize + 1, space.count());
        }
    }

    #[test]
    fn offsets_sum_enabled_predecessors() {
        let mut space = DataSpace::new();
        space.register(cell(CellKind::Float, 4, 1, true)).unwrap();
        space.register(cell(CellKind::Uint, 2, 4, false)).unwrap();
        space.register(cell(CellKind::Uint, 1, 3, true)).unwrap();

        let (_, offset) = space.seek(2).unwrap();
        // The disabled uint16[4] in between contributes nothing.
        assert_eq!(4, offset);
        assert_eq!(4 + 3, space.data_enabled);
        assert_eq!(4 + 8 + 3, space.data_max);
    }

    #[test]
    fn permanent_cells_are_forced_on_and_stay_on() {
        let mut space = DataSpace::new();
        let mut ty = CellType::new(CellKind::Uint, 4);
        ty.set_permanent(true);
        let index = space
            .register(DataCell {
                ty,
                count: 1,
                ptr: None,
                name: "perm",
                unit: "",
                on_change: None,
                rate: UpdateRate::default(),
            })
            .unwrap();
        assert!(space.get(index).unwrap().ty.enabled());
        assert_eq!(
            Err(Error::PermissionDenied),
            space.set_enabled(index, false)
        );
    }

    #[test]
    fn enable_accounting() {
        let mut space = DataSpace::new();
        let index = space.register(cell(CellKind::Uint, 2, 4, false)).unwrap();
        assert_eq!(0, space.data_enabled);
        space.set_enabled(index, true).unwrap();
        assert_eq!(8, space.data_enabled);
        // Idempotent.
        space.set_enabled(index, true).unwrap();
        assert_eq!(8, space.data_enabled);
        space.set_enabled(index, false).unwrap();
        assert_eq!(0, space.data_enabled);
    }

    #[test]
    fn unknown_index_is_bad_address() {
        let mut space = DataSpace::new();
        assert_eq!(Err(Error::BadAddress), space.set_enabled(3, true));
        assert!(space.seek(0).is_none());
    }
}
