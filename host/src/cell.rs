//! Data cells: typed handles onto host memory.

use core::ptr::NonNull;

use bitfield::bitfield;
use num_traits::FromPrimitive;

bitfield! {
    /// The packed 16-bit cell type word. The layout travels on the wire in
    /// `GetDataCellParams` replies and is part of the protocol.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CellType(u16);
    impl Debug;
    /// Cell contributes to the current strobe.
    pub enabled, set_enabled: 0;
    /// Byte width exponent: 0 -> 1 byte, 1 -> 2, 2 -> 4, 3 -> 8.
    pub width_exp, set_width_exp: 3, 1;
    kind_bits, set_kind_bits: 7, 4;
    /// Client writes are accepted.
    pub writeable, set_writeable: 8;
    /// Cell can never be removed from the strobe.
    pub permanent, set_permanent: 9;
}

/// Value category of a cell, bits 4..=7 of the type word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CellKind {
    Bool = 0,
    Char = 1,
    Uint = 2,
    Int = 3,
    Float = 4,
}

impl CellType {
    pub fn new(kind: CellKind, width: u8) -> Self {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8));
        let mut ty = CellType(0);
        ty.set_kind_bits(kind as u16);
        ty.set_width_exp(width.trailing_zeros() as u16);
        ty
    }

    pub fn kind(&self) -> Option<CellKind> {
        CellKind::from_u16(self.kind_bits())
    }

    /// Element width in bytes, always at least 1.
    pub fn byte_width(&self) -> usize {
        1 << self.width_exp()
    }

    /// The word as reported by `GetDataCellParams`: the volatile enable bit
    /// is runtime state, not a cell parameter, and is masked out.
    pub fn reported(&self) -> u16 {
        self.0 & !0x0001
    }

    pub fn raw(&self) -> u16 {
        self.0
    }
}

/// Per-cell strobe rate divider: `counter` counts strobe cycles down and is
/// reloaded from `reload` when the cell is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpdateRate {
    pub reload: u16,
    pub counter: u16,
}

impl Default for UpdateRate {
    fn default() -> Self {
        Self {
            reload: 1,
            counter: 1,
        }
    }
}

impl UpdateRate {
    pub fn every(cycles: u16) -> Self {
        Self {
            reload: cycles,
            counter: cycles,
        }
    }
}

/// Accept-or-reject hook offered the raw bytes of a client write before they
/// reach cell memory.
pub type OnChange = fn(&[u8]) -> bool;

/// One registered cell. Cells are append-only and live in registration order.
pub struct DataCell {
    pub(crate) ty: CellType,
    pub(crate) count: u16,
    pub(crate) ptr: Option<NonNull<u8>>,
    pub(crate) name: &'static str,
    pub(crate) unit: &'static str,
    pub(crate) on_change: Option<OnChange>,
    pub(crate) rate: UpdateRate,
}

impl DataCell {
    /// Bytes this cell contributes to a strobe when enabled.
    pub(crate) fn footprint(&self) -> usize {
        self.count as usize * self.ty.byte_width()
    }
}

/// Types that can back a data cell, for the typed registration helpers.
pub trait CellData: Copy {
    const KIND: CellKind;
    const WIDTH: u8;
}

macro_rules! cell_data {
    ($($t:ty => $kind:expr, $width:expr;)*) => {
        $(
            impl CellData for $t {
                const KIND: CellKind = $kind;
                const WIDTH: u8 = $width;
            }
        )*
    };
}

cell_data! {
    bool => CellKind::Bool, 1;
    u8 => CellKind::Uint, 1;
    u16 => CellKind::Uint, 2;
    u32 => CellKind::Uint, 4;
    u64 => CellKind::Uint, 8;
    i8 => CellKind::Int, 1;
    i16 => CellKind::Int, 2;
    i32 => CellKind::Int, 4;
    i64 => CellKind::Int, 8;
    f32 => CellKind::Float, 4;
    f64 => CellKind::Float, 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_word_layout() {
        let ty = CellType::new(CellKind::Uint, 2);
        assert_eq!(0x0022, ty.raw());
        assert_eq!(2, ty.byte_width());
        assert_eq!(Some(CellKind::Uint), ty.kind());

        let ty = CellType::new(CellKind::Float, 4);
        assert_eq!(0x0044, ty.raw());
        assert_eq!(4, ty.byte_width());
    }

    #[test]
    fn enable_bit_is_masked_in_report() {
        let mut ty = CellType::new(CellKind::Uint, 2);
        ty.set_enabled(true);
        assert_eq!(0x0023, ty.raw());
        assert_eq!(0x0022, ty.reported());
    }

    #[test]
    fn widths_span_one_to_eight() {
        for width in [1u8, 2, 4, 8] {
            let ty = CellType::new(CellKind::Int, width);
            assert_eq!(width as usize, ty.byte_width());
        }
    }

    #[test]
    fn flags() {
        let mut ty = CellType::new(CellKind::Bool, 1);
        ty.set_writeable(true);
        ty.set_permanent(true);
        assert!(ty.writeable());
        assert!(ty.permanent());
        assert_eq!(0x0300, ty.raw());
    }
}
