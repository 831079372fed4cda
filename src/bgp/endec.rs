//! BGP packet encoding and decoding

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::{
    Error, Family, Message, MessageHeaderErrorSubcode, Notification, NotificationErrorCode, Open,
    RouteRefresh, Update, MARKER,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio_util::codec::{Decoder, Encoder};

/// Length of the fixed message header
pub const HEADER_LEN: usize = 19;

/// Largest message without the extended message capability
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Session state that changes how messages are decoded
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeContext {
    /// Address families whose NLRI carry ADD-PATH path identifiers
    pub add_path_families: Vec<Family>,
    /// Whether AS numbers in AS_PATH are 4 bytes, or `None` to guess
    pub four_octet_as: Option<bool>,
}

impl DecodeContext {
    /// Check if NLRI of `family` carry path identifiers
    #[must_use]
    pub fn has_path_id(&self, family: Family) -> bool {
        self.add_path_families.contains(&family)
    }
}

/// Validated fixed header of a message
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Total length of the message, including the header
    pub length: u16,
    pub type_: MessageType,
}

impl Header {
    /// Length of the message body
    #[must_use]
    pub fn body_len(&self) -> usize {
        usize::from(self.length) - HEADER_LEN
    }
}

/// Validate the fixed header (RFC 4271 Section 6.1)
///
/// `src` must hold at least [`HEADER_LEN`] bytes.
pub fn decode_header(src: &[u8]) -> Result<Header, Error> {
    if src.len() < HEADER_LEN {
        return Err(Error::InternalLength("header", std::cmp::Ordering::Less));
    }
    if src[..MARKER.len()] != MARKER {
        return Err(Error::Marker);
    }
    let length = u16::from_be_bytes([src[16], src[17]]);
    if usize::from(length) < HEADER_LEN || usize::from(length) > MAX_MESSAGE_LEN {
        return Err(Error::BadLength(length));
    }
    let type_ = src[18];
    let type_ = MessageType::from_u8(type_).ok_or(Error::MessageType(type_))?;
    let body_len = usize::from(length) - HEADER_LEN;
    let acceptable = match type_ {
        // Version, AS, hold time, BGP ID, parameter length
        MessageType::Open => body_len >= 10,
        // Withdrawn routes length and total path attribute length
        MessageType::Update => body_len >= 4,
        MessageType::Notification => body_len >= 2,
        MessageType::Keepalive => body_len == 0,
        MessageType::RouteRefresh => body_len == 4,
    };
    if acceptable {
        Ok(Header { length, type_ })
    } else {
        Err(Error::BadLength(length))
    }
}

/// Decode a message body whose header has been validated by [`decode_header`]
pub fn decode_body(type_: MessageType, mut body: Bytes, ctx: &DecodeContext) -> Result<Message, Error> {
    let message = match type_ {
        MessageType::Open => Message::Open(Open::from_bytes(&mut body).map_err(Error::in_open)?),
        MessageType::Update => Message::Update(Update::decode(&mut body, ctx)?),
        MessageType::Notification => Message::Notification(Notification::from_bytes(&mut body)?),
        MessageType::Keepalive => Message::Keepalive,
        MessageType::RouteRefresh => Message::RouteRefresh(RouteRefresh::from_bytes(&mut body)?),
    };
    if body.has_remaining() {
        log::debug!("Remaining bytes after decoding: {body:?}");
        return Err(Error::Malformed(
            NotificationErrorCode::MessageHeaderError,
            MessageHeaderErrorSubcode::BadMessageLength as u8,
            Bytes::new(),
        ));
    }
    Ok(message)
}

/// BGP packet encoder
#[derive(Clone, Debug, Default)]
pub struct BgpCodec {
    pub context: DecodeContext,
}

impl BgpCodec {
    #[must_use]
    pub const fn new(context: DecodeContext) -> Self {
        Self { context }
    }
}

impl Decoder for BgpCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = decode_header(&src[..HEADER_LEN])?;
        let length = usize::from(header.length);
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        log::trace!("Valid BGP header: {header:?}");
        let mut frame = src.split_to(length).freeze();
        frame.advance(HEADER_LEN);
        decode_body(header.type_, frame, &self.context).map(Some)
    }
}

impl Encoder<Message> for BgpCodec {
    // tokio requires the Error type to be `From<io::Error>`, but actually ours is `!`
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_slice(&MARKER);
        let len_pos = dst.len();
        dst.put_u16(0); // Placeholder for length
        dst.put_u8(item.message_type() as u8);
        let len = match item {
            Message::Open(msg) => msg.to_bytes(dst),
            Message::Update(msg) => msg.to_bytes(dst),
            Message::Notification(msg) => msg.to_bytes(dst),
            Message::Keepalive => 0,
            Message::RouteRefresh(msg) => msg.to_bytes(dst),
        };
        let len = len + HEADER_LEN;
        debug_assert_eq!(dst.len() - start, len);
        let len = u16::try_from(len).expect("Message length overflow");
        let len_bytes = len.to_be_bytes();
        dst[len_pos] = len_bytes[0];
        dst[len_pos + 1] = len_bytes[1];
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Primitive)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

/// BGP packet component with a fixed length or containing a length field
pub trait Component {
    /// Decode the component from a buffer.
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error>
    where
        Self: Sized;

    /// Encode the component into a buffer.
    ///
    /// Returns the number of bytes written.
    fn to_bytes(self, dst: &mut BytesMut) -> usize;

    /// Find out the length of the component, preferably without encoding it.
    fn encoded_len(&self) -> usize;
}

impl Component for Ipv4Addr {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        ensure_remaining!(src, 4, "IPv4 address");
        let octets = src.get_u32();
        Ok(Self::from(octets))
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        dst.put_u32(self.into());
        4
    }

    fn encoded_len(&self) -> usize {
        4
    }
}

impl Component for Ipv6Addr {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        ensure_remaining!(src, 16, "IPv6 address");
        let mut octets = [0; 16];
        src.copy_to_slice(&mut octets);
        Ok(Self::from(octets))
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        dst.put_slice(&self.octets());
        16
    }

    fn encoded_len(&self) -> usize {
        16
    }
}

impl Component for IpAddr {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        if src.remaining() == 4 {
            Ok(Self::V4(Ipv4Addr::from_bytes(src)?))
        } else if src.remaining() == 16 {
            Ok(Self::V6(Ipv6Addr::from_bytes(src)?))
        } else {
            Err(Error::InternalLength(
                "IP address",
                std::cmp::Ordering::Equal,
            ))
        }
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        match self {
            Self::V4(addr) => addr.to_bytes(dst),
            Self::V6(addr) => addr.to_bytes(dst),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::V4(addr) => addr.encoded_len(),
            Self::V6(addr) => addr.encoded_len(),
        }
    }
}

macro_rules! impl_component_for_intn {
    ($typ:ty, $getter:ident, $putter:ident, $n:expr) => {
        impl Component for $typ {
            fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
                ensure_remaining!(src, $n, stringify!($typ));
                Ok(src.$getter())
            }

            fn to_bytes(self, dst: &mut BytesMut) -> usize {
                dst.$putter(self);
                $n
            }

            fn encoded_len(&self) -> usize {
                $n
            }
        }
    };
}

impl_component_for_intn!(u8, get_u8, put_u8, 1);
impl_component_for_intn!(u16, get_u16, put_u16, 2);
impl_component_for_intn!(u32, get_u32, put_u32, 4);
