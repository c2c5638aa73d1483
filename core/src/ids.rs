use core::fmt::{self, Display};

// PROCESS ID
// ================================================================================================

/// Identifies one spawned process within a trace session.
///
/// Ids are dense and assigned by insertion order into the process table. The first spawned
/// process is always process 0, which is also the process named by the initial schedule step.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Returns the id of the first spawned process.
    pub const fn first() -> Self {
        Self(0)
    }

    /// Returns the id as a `usize`, suitable for indexing dense per-process tables.
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for ProcessId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// OBJECT ID
// ================================================================================================

/// Names one shared atomic cell within a single run.
///
/// Ids increase monotonically starting at 1 and are reset between runs: replays recreate every
/// cell deterministically, so a given id names the same cell across replays of the same
/// schedule.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Returns the id as a raw integer.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ObjectId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ObjectId> for u64 {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
