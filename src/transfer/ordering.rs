//! Lock ordering
//!
//! Every scope that touches a pair of accounts locks them in ascending id
//! order, whichever of the two is the source. With one global order there is
//! no circular wait between two transfers over the same pair.

/// Lock-acquisition order for the two accounts of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOrder {
    first: i64,
    second: i64,
    source_first: bool,
}

impl LockOrder {
    pub fn new(from_account_id: i64, to_account_id: i64) -> Self {
        if from_account_id <= to_account_id {
            Self {
                first: from_account_id,
                second: to_account_id,
                source_first: true,
            }
        } else {
            Self {
                first: to_account_id,
                second: from_account_id,
                source_first: false,
            }
        }
    }

    /// Account locked first (the smaller id)
    pub fn first(&self) -> i64 {
        self.first
    }

    /// Account locked second (the larger id)
    pub fn second(&self) -> i64 {
        self.second
    }

    /// Ids in acquisition order
    pub fn ids(&self) -> [i64; 2] {
        [self.first, self.second]
    }

    /// Whether the source account is locked first
    pub fn source_first(&self) -> bool {
        self.source_first
    }

    /// Reorder values produced in lock order into `(source, destination)`.
    pub fn to_transfer_order<T>(&self, first: T, second: T) -> (T, T) {
        if self.source_first {
            (first, second)
        } else {
            (second, first)
        }
    }

    /// Reorder `(source, destination)` values into lock order.
    pub fn to_lock_order<T>(&self, source: T, destination: T) -> (T, T) {
        // The permutation of two elements is its own inverse.
        self.to_transfer_order(source, destination)
    }
}
