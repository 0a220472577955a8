//! Prediction filter lookup tables.
//!
//! A filter of up to 128 taps is split into 16 groups of 8 taps. Each group
//! becomes a 256 entry table indexed by one byte of the channel's decoded
//! bit history, so a prediction costs 16 lookups instead of 128 multiplies.

/// Number of lookup tables per filter.
pub const TABLES: usize = 16;
/// Maximum prediction order.
pub const MAX_ORDER: usize = TABLES * 8;

/// Precomputed lookup tables for a single filter.
#[derive(Clone)]
pub struct FilterTables {
    tables: Box<[[i16; 256]; TABLES]>,
}

impl FilterTables {
    /// Expand `coefficients` (one per tap, at most 128) into lookup tables.
    pub fn new(coefficients: &[i16]) -> Self {
        debug_assert!(coefficients.len() <= MAX_ORDER);
        let order = coefficients.len();
        let mut tables = Box::new([[0i16; 256]; TABLES]);
        for (t, table) in tables.iter_mut().enumerate() {
            let taps = order.saturating_sub(t * 8).min(8);
            if taps == 0 {
                continue;
            }
            let coefs = &coefficients[t * 8..t * 8 + taps];
            for (index, entry) in table.iter_mut().enumerate() {
                let mut sum = 0i32;
                for (j, &coef) in coefs.iter().enumerate() {
                    let sign = (((index >> j) & 1) as i32) * 2 - 1;
                    sum += sign * i32::from(coef);
                }
                *entry = sum as i16;
            }
        }
        Self { tables }
    }

    /// Prediction for a channel whose last 128 output bits are `history`,
    /// most recent bit in the least significant position.
    #[inline]
    pub fn predict(&self, history: u128) -> i16 {
        let mut predict = 0i16;
        for (t, table) in self.tables.iter().enumerate() {
            let byte = (history >> (t * 8)) as u8;
            predict = predict.wrapping_add(table[usize::from(byte)]);
        }
        predict
    }

    pub fn entry(&self, table: usize, index: u8) -> i16 {
        self.tables[table][usize::from(index)]
    }
}

impl std::fmt::Debug for FilterTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterTables").finish_non_exhaustive()
    }
}
