use std::fmt::{Debug, Display, Formatter};

/// Transport session identifier: names one sender's stream. It consists of the sender's
///  globally unique source id (GSI) and the data-source port.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Tsi {
    pub gsi: [u8; 6],
    pub sport: u16,
}

impl Tsi {
    pub const fn new(gsi: [u8; 6], sport: u16) -> Tsi {
        Tsi { gsi, sport }
    }
}

impl Display for Tsi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let g = &self.gsi;
        write!(f, "{}.{}.{}.{}.{}.{}.{}", g[0], g[1], g[2], g[3], g[4], g[5], self.sport)
    }
}

impl Debug for Tsi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
