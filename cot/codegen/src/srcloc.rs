//! Source locations.
//!
//! Locations are byte offsets into the compilation unit's source text. They
//! are carried through every pipeline stage but never interpreted by the
//! core; the frontend owns the mapping back to line/column.

use core::fmt;

/// A source location. The default instance is the "unknown" location.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceLoc(u32);

impl SourceLoc {
    /// Create a new location from a byte offset.
    pub fn new(offset: u32) -> Self {
        Self(offset)
    }

    /// Is this the default "unknown" location?
    pub fn is_default(self) -> bool {
        self.0 == 0
    }

    /// The byte offset of this location.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_default() {
            write!(f, "@-")
        } else {
            write!(f, "@{:04x}", self.0)
        }
    }
}
