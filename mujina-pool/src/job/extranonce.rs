//! Extranonce allocation.

/// Reserved gap in job coinbases that miners overwrite with
/// `extranonce1 || extranonce2`. Its width fixes both sizes.
pub const PLACEHOLDER: [u8; 8] = [0xf0, 0x00, 0x00, 0x0f, 0xf1, 0x11, 0x11, 0x1f];

/// Allocates per-subscription extranonce1 values, partitioned by pool
/// instance so horizontally scaled pools never hand out overlapping
/// search spaces.
#[derive(Debug)]
pub struct ExtranonceCounter {
    counter: i64,
}

impl ExtranonceCounter {
    /// `instance_id` seeds the top bits of the counter space.
    pub fn new(instance_id: u32) -> Self {
        ExtranonceCounter {
            counter: (instance_id.wrapping_shl(27) as i32) as i64,
        }
    }

    /// Next extranonce1 as zero-padded hex.
    pub fn next(&mut self) -> String {
        self.counter += 1;
        format!("{:08x}", (self.counter as i32).unsigned_abs())
    }

    /// Width of extranonce1 in bytes.
    pub const fn size(&self) -> usize {
        4
    }

    /// Bytes left in the placeholder for the miner-chosen extranonce2.
    pub fn extranonce2_size(&self) -> usize {
        PLACEHOLDER.len() - self.size()
    }
}

/// Issues job ids as compact hex strings, wrapping before they grow
/// past four digits.
#[derive(Debug, Default)]
pub struct JobCounter {
    counter: u32,
}

impl JobCounter {
    pub fn next(&mut self) -> String {
        self.counter += 1;
        if self.counter % 0xffff == 0 {
            self.counter = 1;
        }
        format!("{:x}", self.counter)
    }
}
