use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

/// Milliseconds since the Unix epoch.
pub fn physical_now() -> Result<u64, CoreError> {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| CoreError::InvalidData(format!("wall clock reads before 1970: {e}")))?;
    u64::try_from(since_epoch.as_millis())
        .map_err(|_| CoreError::InvalidData("wall clock out of range".into()))
}

/// Source of physical time. The store stamps records with it and clients use
/// it for debounce, heartbeat and lock-window deadlines.
pub trait PhysicalClock: Send + Sync {
    fn now_ms(&self) -> Result<u64, CoreError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_ms(&self) -> Result<u64, CoreError> {
        physical_now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicU64::new(start_ms),
        })
    }

    pub fn advance_ms(&self, delta: u64) -> u64 {
        self.now_ms.fetch_add(delta, AtomicOrdering::SeqCst) + delta
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, AtomicOrdering::SeqCst);
    }

    pub fn get_ms(&self) -> u64 {
        self.now_ms.load(AtomicOrdering::SeqCst)
    }
}

impl PhysicalClock for ManualClock {
    fn now_ms(&self) -> Result<u64, CoreError> {
        Ok(self.get_ms())
    }
}

/// Hybrid logical timestamp used as a record's `modified_at` and as the
/// position of a cursor. The counter separates writes that land in the same
/// millisecond, so two records never share a timestamp.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct Hlc {
    wall_ms: u64,
    counter: u32,
}

impl Hlc {
    pub const ZERO: Hlc = Hlc {
        wall_ms: 0,
        counter: 0,
    };

    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn epoch_seconds(&self) -> i64 {
        (self.wall_ms / 1000) as i64
    }

    /// Largest timestamp whose wall time is `wall_ms`. Everything strictly after
    /// it happened in a later millisecond.
    pub fn end_of_ms(wall_ms: u64) -> Self {
        Self::new(wall_ms, u32::MAX)
    }

    /// Storage form: wall time then counter, both big-endian, so comparing
    /// blobs in SQLite orders records by time.
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        let (wall, counter) = out.split_at_mut(8);
        wall.copy_from_slice(&self.wall_ms.to_be_bytes());
        counter.copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 12]) -> Self {
        let (wall, counter) = bytes.split_at(8);
        let wall_ms = wall.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        let counter = counter.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        Self { wall_ms, counter }
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.wall_ms, self.counter).cmp(&(other.wall_ms, other.counter))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let len = raw.len();
        let stamp: [u8; 12] = raw
            .try_into()
            .map_err(|_| serde::de::Error::invalid_length(len, &"a 12-byte timestamp"))?;
        Ok(Hlc::from_bytes(&stamp))
    }
}

/// Issues strictly increasing [`Hlc`]s from a physical clock. The store owns
/// one and ticks it inside each write transaction.
pub struct HlcClock {
    physical: Arc<dyn PhysicalClock>,
    wall_ms: u64,
    counter: u32,
}

impl HlcClock {
    pub fn new(physical: Arc<dyn PhysicalClock>) -> Self {
        Self {
            physical,
            wall_ms: 0,
            counter: 0,
        }
    }

    /// The most recent timestamp issued or observed.
    pub fn last(&self) -> Hlc {
        Hlc::new(self.wall_ms, self.counter)
    }

    pub fn physical_ms(&self) -> Result<u64, CoreError> {
        self.physical.now_ms()
    }

    /// Generate the next strictly increasing timestamp.
    pub fn tick(&mut self) -> Result<Hlc, CoreError> {
        let now = self.physical.now_ms()?;

        let next = match now.cmp(&self.wall_ms) {
            Ordering::Greater => Hlc::new(now, 0),
            _ => {
                let counter = self.counter.checked_add(1).ok_or_else(|| {
                    CoreError::InvalidData("hlc counter overflow within one millisecond".into())
                })?;
                Hlc::new(self.wall_ms, counter)
            }
        };
        self.wall_ms = next.wall_ms;
        self.counter = next.counter;
        Ok(next)
    }

    /// Fold in a timestamp issued earlier (e.g. loaded from disk) so later
    /// ticks stay above it even if the wall clock went backwards.
    pub fn observe(&mut self, seen: Hlc) {
        if seen > self.last() {
            self.wall_ms = seen.wall_ms;
            self.counter = seen.counter;
        }
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
