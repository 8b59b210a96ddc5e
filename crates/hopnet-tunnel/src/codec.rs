//! Cell framing.
//!
//! ## Cell layout
//!
//! ```text
//! IV (16) | checksum (4) | non-zero padding | 0x00 | records
//! ```
//!
//! The checksum is the first 4 bytes of `SHA-256(IV || records)`. The
//! padding fills the cell so that the records end exactly at byte 1024.
//!
//! ## Record layout
//!
//! First fragment (or whole message), control bit 7 clear:
//!
//! ```text
//! control | [tunnel id (4)] | [router hash (32)] | [message id (4)] | size (2) | payload
//! ```
//!
//! - bits 5-6: delivery type (0 local, 1 tunnel, 2 router)
//! - bit 3: fragmented, message id present
//! - bit 2: extended options, must be clear
//!
//! Follow-on fragment, control bit 7 set:
//!
//! ```text
//! control | message id (4) | size (2) | payload
//! ```
//!
//! - bits 1-6: fragment number (1-63)
//! - bit 0: last fragment

use hopnet_types::identity::{RouterHash, TunnelId};
use rand::Rng;

use crate::{Cell, Result, TunnelError, CELL_SIZE, CHECKSUM_SIZE, FULL_SIZE, IV_SIZE, MAX_FRAGMENTS};

const MASK_IS_SUBSEQUENT: u8 = 0x80;
const MASK_TYPE: u8 = 0x60;
const SHIFT_TYPE: u8 = 5;
const MASK_FRAGMENTED: u8 = 0x08;
const MASK_EXTENDED: u8 = 0x04;
const MASK_FRAGMENT_NUM: u8 = 0x7E;
const SHIFT_FRAGMENT_NUM: u8 = 1;
const MASK_IS_LAST: u8 = 0x01;

const TYPE_LOCAL: u8 = 0;
const TYPE_TUNNEL: u8 = 1;
const TYPE_ROUTER: u8 = 2;

/// Offset of the first padding byte.
const PADDING_START: usize = IV_SIZE + CHECKSUM_SIZE;

/// Instruction bytes on every follow-on fragment.
pub const SUBSEQUENT_INSTRUCTIONS_SIZE: usize = 1 + 4 + 2;

/// Extra instruction bytes when a first fragment carries a message id.
pub const FRAGMENTED_EXTRA_SIZE: usize = 4;

/// Where the endpoint should send a reassembled message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// To the endpoint router itself.
    Local,
    /// To an inbound gateway on another router.
    Tunnel { router: RouterHash, tunnel: TunnelId },
    /// Directly to another router.
    Router(RouterHash),
}

impl Delivery {
    /// Delivery for the optional router and tunnel a gateway was given.
    pub fn from_target(to_router: Option<RouterHash>, to_tunnel: Option<TunnelId>) -> Self {
        match (to_router, to_tunnel) {
            (Some(router), Some(tunnel)) => Self::Tunnel { router, tunnel },
            (Some(router), None) => Self::Router(router),
            (None, _) => Self::Local,
        }
    }

    pub fn router(&self) -> Option<RouterHash> {
        match self {
            Self::Local => None,
            Self::Tunnel { router, .. } | Self::Router(router) => Some(*router),
        }
    }

    pub fn tunnel(&self) -> Option<TunnelId> {
        match self {
            Self::Tunnel { tunnel, .. } => Some(*tunnel),
            _ => None,
        }
    }

    fn type_bits(&self) -> u8 {
        match self {
            Self::Local => TYPE_LOCAL,
            Self::Tunnel { .. } => TYPE_TUNNEL,
            Self::Router(_) => TYPE_ROUTER,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Local => 0,
            Self::Tunnel { .. } => 4 + 32,
            Self::Router(_) => 32,
        }
    }
}

/// Instruction bytes for a first fragment.
pub fn first_instructions_size(delivery: &Delivery, fragmented: bool) -> usize {
    let id = if fragmented { FRAGMENTED_EXTRA_SIZE } else { 0 };
    1 + delivery.encoded_len() + id + 2
}

/// One decoded record.
#[derive(Debug, PartialEq, Eq)]
pub enum Fragment<'a> {
    /// A whole message (`message_id` is `None`) or fragment 0 of one.
    First {
        delivery: Delivery,
        message_id: Option<u32>,
        payload: &'a [u8],
    },
    /// Fragment 1..=63 of a message.
    Follow {
        message_id: u32,
        number: u8,
        is_last: bool,
        payload: &'a [u8],
    },
}

/// Accumulates records for one cell.
pub struct CellWriter {
    buf: [u8; FULL_SIZE],
    len: usize,
}

impl CellWriter {
    pub fn new() -> Self {
        Self {
            buf: [0u8; FULL_SIZE],
            len: 0,
        }
    }

    /// Record bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record bytes still available.
    pub fn remaining(&self) -> usize {
        FULL_SIZE - self.len
    }

    /// Write a first-fragment record.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Internal`] if the record does not fit
    pub fn write_first(
        &mut self,
        delivery: &Delivery,
        message_id: Option<u32>,
        payload: &[u8],
    ) -> Result<()> {
        let needed = first_instructions_size(delivery, message_id.is_some()) + payload.len();
        self.ensure(needed)?;

        let mut control = delivery.type_bits() << SHIFT_TYPE;
        if message_id.is_some() {
            control |= MASK_FRAGMENTED;
        }
        self.put(&[control]);
        if let Delivery::Tunnel { tunnel, .. } = delivery {
            self.put(&tunnel.to_be_bytes());
        }
        if let Some(router) = delivery.router() {
            self.put(router.as_bytes());
        }
        if let Some(id) = message_id {
            self.put(&id.to_be_bytes());
        }
        self.put(&(payload.len() as u16).to_be_bytes());
        self.put(payload);
        Ok(())
    }

    /// Write a follow-on fragment record.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Internal`] if the record does not fit or `number` is
    ///   outside 1..=63
    pub fn write_follow(
        &mut self,
        message_id: u32,
        number: u8,
        is_last: bool,
        payload: &[u8],
    ) -> Result<()> {
        if number == 0 || usize::from(number) >= MAX_FRAGMENTS {
            return Err(TunnelError::Internal(format!(
                "fragment number {number} out of range"
            )));
        }
        self.ensure(SUBSEQUENT_INSTRUCTIONS_SIZE + payload.len())?;

        let mut control = MASK_IS_SUBSEQUENT | (number << SHIFT_FRAGMENT_NUM);
        if is_last {
            control |= MASK_IS_LAST;
        }
        self.put(&[control]);
        self.put(&message_id.to_be_bytes());
        self.put(&(payload.len() as u16).to_be_bytes());
        self.put(payload);
        Ok(())
    }

    /// Build the cell with a fresh random IV. Returns the cell and the number
    /// of padding bytes used.
    pub fn seal(&self) -> (Box<Cell>, usize) {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill(&mut iv);
        self.seal_with_iv(iv)
    }

    /// Build the cell around `iv`.
    pub fn seal_with_iv(&self, iv: [u8; IV_SIZE]) -> (Box<Cell>, usize) {
        let records = &self.buf[..self.len];
        let mut cell = Box::new([0u8; CELL_SIZE]);
        cell[..IV_SIZE].copy_from_slice(&iv);
        cell[IV_SIZE..PADDING_START].copy_from_slice(&checksum(&iv, records));

        let records_start = CELL_SIZE - self.len;
        let terminator = records_start - 1;
        let mut rng = rand::thread_rng();
        for b in &mut cell[PADDING_START..terminator] {
            *b = rng.gen_range(1..=u8::MAX);
        }
        cell[terminator] = 0;
        cell[records_start..].copy_from_slice(records);
        (cell, terminator - PADDING_START)
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if needed > self.remaining() {
            return Err(TunnelError::Internal(format!(
                "record of {needed} bytes does not fit in {} remaining",
                self.remaining()
            )));
        }
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }
}

impl Default for CellWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn checksum(iv: &[u8], records: &[u8]) -> [u8; CHECKSUM_SIZE] {
    hopnet_crypto::sha256::truncated4(&[iv, records])
}

/// Strip the envelope from a decrypted cell and return its record bytes.
///
/// # Errors
///
/// - [`TunnelError::Corrupt`] if no terminator is found or the checksum fails
pub fn open(cell: &Cell) -> Result<&[u8]> {
    let terminator = cell[PADDING_START..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| p + PADDING_START)
        .ok_or_else(|| TunnelError::Corrupt("no padding terminator".into()))?;
    let records = &cell[terminator + 1..];
    let iv = &cell[..IV_SIZE];
    if checksum(iv, records)[..] != cell[IV_SIZE..PADDING_START] {
        return Err(TunnelError::Corrupt("checksum mismatch".into()));
    }
    Ok(records)
}

/// Iterate the records of an opened cell.
pub fn records(data: &[u8]) -> Records<'_> {
    Records {
        reader: Reader { data, pos: 0 },
        failed: false,
    }
}

/// Iterator over records. Stops after the first error.
pub struct Records<'a> {
    reader: Reader<'a>,
    failed: bool,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Fragment<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_empty() {
            return None;
        }
        let item = read_record(&mut self.reader);
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

fn read_record<'a>(r: &mut Reader<'a>) -> Result<Fragment<'a>> {
    let control = r.u8()?;
    if control & MASK_IS_SUBSEQUENT != 0 {
        let number = (control & MASK_FRAGMENT_NUM) >> SHIFT_FRAGMENT_NUM;
        if number == 0 {
            return Err(TunnelError::Corrupt("follow-on fragment numbered 0".into()));
        }
        let message_id = r.u32()?;
        let size = usize::from(r.u16()?);
        let payload = r.take(size)?;
        return Ok(Fragment::Follow {
            message_id,
            number,
            is_last: control & MASK_IS_LAST != 0,
            payload,
        });
    }

    if control & MASK_EXTENDED != 0 {
        return Err(TunnelError::Corrupt("extended options not supported".into()));
    }
    let delivery = match (control & MASK_TYPE) >> SHIFT_TYPE {
        TYPE_LOCAL => Delivery::Local,
        TYPE_TUNNEL => {
            let tunnel = TunnelId::from_be_bytes(r.array()?)
                .map_err(|e| TunnelError::Corrupt(e.to_string()))?;
            Delivery::Tunnel {
                tunnel,
                router: RouterHash::from_bytes(r.array()?),
            }
        }
        TYPE_ROUTER => Delivery::Router(RouterHash::from_bytes(r.array()?)),
        other => {
            return Err(TunnelError::Corrupt(format!("unknown delivery type {other}")));
        }
    };
    let message_id = if control & MASK_FRAGMENTED != 0 {
        Some(r.u32()?)
    } else {
        None
    };
    let size = usize::from(r.u16()?);
    let payload = r.take(size)?;
    Ok(Fragment::First {
        delivery,
        message_id,
        payload,
    })
}

/// Bounds-checked cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        let Some(end) = end else {
            return Err(TunnelError::Corrupt(format!(
                "field of {n} bytes at offset {} overruns {} record bytes",
                self.pos,
                self.data.len()
            )));
        };
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }
}
