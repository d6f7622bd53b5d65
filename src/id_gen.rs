use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};

const MACHINE_BITS: u32 = 7;
const SEQUENCE_BITS: u32 = 13;
const MACHINE_MASK: u64 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_SHIFT: u32 = MACHINE_BITS + SEQUENCE_BITS;

/// Crockford base32, no I/L/O/U
const TOKEN_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const TOKEN_LEN: usize = 13;

/// 64-bit snowflake: 44 bits of milliseconds, 7 bits of machine id,
/// 13 bits of sequence. Ids from one machine are strictly increasing, also
/// when the clock steps backwards.
pub struct SnowflakeGen {
    machine_id: u64,
    last_ts: u64,
    sequence: u64,
    rng: StdRng,
}

impl SnowflakeGen {
    pub fn new(machine_id: u8) -> Self {
        Self {
            machine_id: machine_id as u64 & MACHINE_MASK,
            last_ts: 0,
            sequence: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn generate_at(&mut self, now_ms: u64) -> u64 {
        let now = now_ms.max(self.last_ts);
        if now == self.last_ts {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
            if self.sequence == 0 {
                // Sequence exhausted, borrow the next millisecond
                self.last_ts += 1;
                self.sequence = self.random_sequence();
                return self.compose();
            }
        } else {
            // Random start keeps ids of restarted processes apart
            self.sequence = self.random_sequence();
        }
        self.last_ts = now;
        self.compose()
    }

    fn random_sequence(&mut self) -> u64 {
        self.rng.random::<u64>() & SEQUENCE_MASK
    }

    fn compose(&self) -> u64 {
        Self::from_parts(self.last_ts, self.machine_id as u8, self.sequence as u16)
    }

    pub fn from_parts(timestamp_ms: u64, machine_id: u8, sequence: u16) -> u64 {
        (timestamp_ms << TIMESTAMP_SHIFT)
            | ((machine_id as u64 & MACHINE_MASK) << SEQUENCE_BITS)
            | (sequence as u64 & SEQUENCE_MASK)
    }

    pub fn timestamp_ms(id: u64) -> u64 {
        id >> TIMESTAMP_SHIFT
    }

    pub fn machine_id(id: u64) -> u8 {
        ((id >> SEQUENCE_BITS) & MACHINE_MASK) as u8
    }

    /// Fixed-width base32 rendering; sorts like the numeric id
    pub fn encode(id: u64) -> String {
        let mut out = [b'0'; TOKEN_LEN];
        let mut rest = id;
        for slot in out.iter_mut().rev() {
            *slot = TOKEN_ALPHABET[(rest & 31) as usize];
            rest >>= 5;
        }
        out.iter().map(|&b| b as char).collect()
    }
}

/// Thread-safe snowflake source for order ids and admission tokens
pub struct IdGenerator {
    inner: Mutex<SnowflakeGen>,
    clock: Arc<dyn Clock>,
}

impl IdGenerator {
    pub fn new(machine_id: u8) -> Self {
        Self::with_clock(machine_id, Arc::new(SystemClock))
    }

    pub fn with_clock(machine_id: u8, clock: Arc<dyn Clock>) -> Self {
        Self { inner: Mutex::new(SnowflakeGen::new(machine_id)), clock }
    }

    pub fn next_id(&self) -> u64 {
        let now_ms = self.clock.now_ms().max(0) as u64;
        self.inner.lock().generate_at(now_ms)
    }

    /// Opaque admission token carried by an order queue entry
    pub fn next_token(&self) -> String {
        SnowflakeGen::encode(self.next_id())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}
