//! Gearman binary framing.
//!
//! Every packet is a 12 byte header (`\0REQ` or `\0RES`, type as u32 BE,
//! body length as u32 BE) followed by NUL separated arguments. The last
//! argument is opaque and may itself contain NUL bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::BrokerError;

pub const REQ_MAGIC: [u8; 4] = *b"\0REQ";
pub const RES_MAGIC: [u8; 4] = *b"\0RES";
pub const HEADER_LEN: usize = 12;
/// Upper bound on a single packet body; anything larger is a framing error.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    fn bytes(self) -> [u8; 4] {
        match self {
            Magic::Request => REQ_MAGIC,
            Magic::Response => RES_MAGIC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    CanDo,
    ResetAbilities,
    PreSleep,
    Noop,
    JobCreated,
    GrabJob,
    NoJob,
    JobAssign,
    WorkComplete,
    WorkFail,
    SubmitJobBg,
    Error,
    SubmitJobHighBg,
    SubmitJobLowBg,
    Unknown(u32),
}

impl PacketType {
    pub fn code(self) -> u32 {
        match self {
            PacketType::CanDo => 1,
            PacketType::ResetAbilities => 3,
            PacketType::PreSleep => 4,
            PacketType::Noop => 6,
            PacketType::JobCreated => 8,
            PacketType::GrabJob => 9,
            PacketType::NoJob => 10,
            PacketType::JobAssign => 11,
            PacketType::WorkComplete => 13,
            PacketType::WorkFail => 14,
            PacketType::SubmitJobBg => 18,
            PacketType::Error => 19,
            PacketType::SubmitJobHighBg => 32,
            PacketType::SubmitJobLowBg => 34,
            PacketType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => PacketType::CanDo,
            3 => PacketType::ResetAbilities,
            4 => PacketType::PreSleep,
            6 => PacketType::Noop,
            8 => PacketType::JobCreated,
            9 => PacketType::GrabJob,
            10 => PacketType::NoJob,
            11 => PacketType::JobAssign,
            13 => PacketType::WorkComplete,
            14 => PacketType::WorkFail,
            18 => PacketType::SubmitJobBg,
            19 => PacketType::Error,
            32 => PacketType::SubmitJobHighBg,
            34 => PacketType::SubmitJobLowBg,
            other => PacketType::Unknown(other),
        }
    }

    /// Number of arguments the body splits into.
    fn arity(self) -> usize {
        match self {
            PacketType::ResetAbilities
            | PacketType::PreSleep
            | PacketType::Noop
            | PacketType::GrabJob
            | PacketType::NoJob => 0,
            PacketType::CanDo
            | PacketType::JobCreated
            | PacketType::WorkFail
            | PacketType::Unknown(_) => 1,
            PacketType::WorkComplete | PacketType::Error => 2,
            PacketType::JobAssign
            | PacketType::SubmitJobBg
            | PacketType::SubmitJobHighBg
            | PacketType::SubmitJobLowBg => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub kind: PacketType,
    pub args: Vec<Vec<u8>>,
}

impl Packet {
    pub fn request(kind: PacketType, args: Vec<Vec<u8>>) -> Self {
        Self {
            magic: Magic::Request,
            kind,
            args,
        }
    }

    pub fn response(kind: PacketType, args: Vec<Vec<u8>>) -> Self {
        Self {
            magic: Magic::Response,
            kind,
            args,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(Vec::as_slice)
    }

    /// Argument as text, lossily decoded; empty when absent.
    pub fn arg_str(&self, index: usize) -> String {
        self.arg(index)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default()
    }

    pub fn encode(&self) -> BytesMut {
        let body_len: usize =
            self.args.iter().map(Vec::len).sum::<usize>() + self.args.len().saturating_sub(1);
        let mut out = BytesMut::with_capacity(HEADER_LEN + body_len);
        out.put_slice(&self.magic.bytes());
        out.put_u32(self.kind.code());
        out.put_u32(body_len as u32);
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                out.put_u8(0);
            }
            out.put_slice(arg);
        }
        out
    }

    /// Take one complete packet off the front of `buf`. `Ok(None)` means more
    /// bytes are needed; `buf` is left untouched in that case.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Packet>, BrokerError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = match &buf[..4] {
            m if m == REQ_MAGIC => Magic::Request,
            m if m == RES_MAGIC => Magic::Response,
            other => {
                return Err(BrokerError::Protocol(format!(
                    "bad packet magic {:?}",
                    other
                )))
            }
        };
        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(BrokerError::Protocol(format!(
                "packet body of {} bytes exceeds limit",
                body_len
            )));
        }
        if buf.len() < HEADER_LEN + body_len {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let body = buf.split_to(body_len);
        let kind = PacketType::from_code(code);
        let args = match kind.arity() {
            0 => Vec::new(),
            arity => body.splitn(arity, |b| *b == 0).map(<[u8]>::to_vec).collect(),
        };

        Ok(Some(Packet { magic, kind, args }))
    }
}
