//! Rice decoding of integer pixel tiles (`ZCMPTYPE = 'RICE_1'`).
//!
//! A tile starts with its first pixel in big-endian order. The rest is a
//! bit stream of blocks: each block opens with a split level `fs`, then
//! carries one mapped difference per pixel. Differences are zigzag mapped
//! (`0, -1, 1, -2, ...` to `0, 1, 2, 3, ...`) and coded as a unary high
//! part followed by `fs` low bits.

use std::io;

/// Pixels per coding block when the header does not name one.
pub const DEFAULT_BLOCK_SIZE: usize = 32;

/// Coding constants for one pixel width.
#[derive(Debug, Clone, Copy)]
struct Coding {
    /// Width of the split-level field.
    fs_bits: u32,
    /// Split level marking a block of raw mapped differences.
    fs_max: u32,
    /// Pixel width in bits.
    bits: u32,
}

impl Coding {
    fn for_bytepix(bytepix: usize) -> io::Result<Self> {
        let (fs_bits, fs_max) = match bytepix {
            1 => (3, 6),
            2 => (4, 14),
            4 => (5, 25),
            _ => return Err(invalid(format!("unsupported Rice pixel width {bytepix}"))),
        };
        Ok(Self {
            fs_bits,
            fs_max,
            bits: 8 * bytepix as u32,
        })
    }

    fn mask(&self) -> u32 {
        u32::MAX >> (32 - self.bits)
    }
}

/// MSB-first reader over a byte slice with a 64-bit window.
struct BitReader<'a> {
    data: &'a [u8],
    next: usize,
    window: u64,
    available: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: 0,
            window: 0,
            available: 0,
        }
    }

    fn refill(&mut self) {
        while self.available <= 56 {
            let Some(&byte) = self.data.get(self.next) else {
                break;
            };
            self.window |= u64::from(byte) << (56 - self.available);
            self.next += 1;
            self.available += 8;
        }
    }

    /// Next `n` bits (at most 32) as an unsigned value.
    fn read(&mut self, n: u32) -> io::Result<u32> {
        if n == 0 {
            return Ok(0);
        }
        if self.available < n {
            self.refill();
            if self.available < n {
                return Err(truncated());
            }
        }
        let value = (self.window >> (64 - n)) as u32;
        self.window <<= n;
        self.available -= n;
        Ok(value)
    }

    /// Count zero bits up to the next set bit, consuming both.
    fn read_unary(&mut self) -> io::Result<u32> {
        let mut zeros: u32 = 0;
        loop {
            if self.available == 0 {
                self.refill();
                if self.available == 0 {
                    return Err(truncated());
                }
            }
            // Bits past `available` are always zero.
            let lz = self.window.leading_zeros();
            if lz < self.available {
                self.window = self.window.checked_shl(lz + 1).unwrap_or(0);
                self.available -= lz + 1;
                return Ok(zeros.saturating_add(lz));
            }
            zeros = zeros.saturating_add(self.available);
            self.window = 0;
            self.available = 0;
        }
    }
}

/// Decode `len` pixels of `bytepix` bytes each.
///
/// One-byte pixels are unsigned; wider pixels are signed.
pub fn decode(data: &[u8], len: usize, bytepix: usize, block_size: usize) -> io::Result<Vec<i32>> {
    let coding = Coding::for_bytepix(bytepix)?;
    if block_size == 0 {
        return Err(invalid("Rice block size is zero"));
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    if data.len() < bytepix {
        return Err(invalid("Rice tile is shorter than its first pixel"));
    }

    let mask = coding.mask();
    let mut last = data[..bytepix]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    let mut bits = BitReader::new(&data[bytepix..]);
    let mut out = Vec::with_capacity(len);

    while out.len() < len {
        let n = block_size.min(len - out.len());
        let code = bits.read(coding.fs_bits)?;

        // Code 0: every pixel repeats the previous one.
        let Some(fs) = code.checked_sub(1) else {
            out.extend(std::iter::repeat_n(widen(last, bytepix), n));
            continue;
        };
        if fs > coding.fs_max {
            return Err(invalid(format!("Rice split level {fs} exceeds {}", coding.fs_max)));
        }

        for _ in 0..n {
            let mapped = if fs == coding.fs_max {
                bits.read(coding.bits)?
            } else {
                let high = bits.read_unary()?;
                (high << fs) | bits.read(fs)?
            };
            let diff = if mapped & 1 == 0 {
                mapped >> 1
            } else {
                !(mapped >> 1)
            };
            last = diff.wrapping_add(last) & mask;
            out.push(widen(last, bytepix));
        }
    }

    Ok(out)
}

fn widen(value: u32, bytepix: usize) -> i32 {
    match bytepix {
        1 => i32::from(value as u8),
        2 => i32::from(value as u16 as i16),
        _ => value as i32,
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "Rice tile ended early")
}
