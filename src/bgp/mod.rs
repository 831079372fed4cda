//! BGP-4 wire format
//!
//! Structs here intend to represent the data instead of the on-wire format.

// SPDX-License-Identifier: AGPL-3.0-or-later

/// Check if the remaining buffer length is exactly the expected length
macro_rules! check_remaining_len {
    ($src:expr, $len:expr, $name:expr) => {
        match $src.remaining().cmp(&$len) {
            std::cmp::Ordering::Equal => {}
            cmp => return Err($crate::bgp::Error::InternalLength($name, cmp)),
        }
    };
}

/// Check if the buffer has at least the expected length left
macro_rules! ensure_remaining {
    ($src:expr, $len:expr, $name:expr) => {
        if $src.remaining() < $len {
            return Err($crate::bgp::Error::InternalLength(
                $name,
                std::cmp::Ordering::Less,
            ));
        }
    };
}

pub mod capability;
pub mod cidr;
pub mod endec;
pub mod path;
pub mod route;
mod update_builder;

pub use capability::{Afi, Family, Safi};
pub use endec::{BgpCodec as Codec, Component, DecodeContext, MessageType};
pub use update_builder::UpdateBuilder;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use capability::{Capabilities, OptionalParameterValue, OptionalParameters};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use path::{AttributeError, PathAttributes};
use route::Routes;
use std::fmt;
use std::net::Ipv4Addr;

/// Supported BGP version
pub const BGP_VERSION: u8 = 4;

/// ASN for AS4
pub const AS_TRANS: u16 = 23456;

/// BGP marker
pub const MARKER: [u8; 16] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Longest shutdown communication in a CEASE (RFC 9003)
pub const MAX_COMMUNICATION_LEN: usize = 128;

/// BGP packet errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid or missing marker")]
    Marker,
    #[error("bad message length {0}")]
    BadLength(u16),
    #[error("invalid message type {0}")]
    MessageType(u8),
    #[error("invalid internal length at {0} ({1:?})")]
    InternalLength(&'static str, std::cmp::Ordering),
    #[error("invalid {0} type of {1}")]
    InternalType(&'static str, u16),
    #[error("malformed message ({0:?}, subcode {1})")]
    Malformed(NotificationErrorCode, u8, Bytes),
    #[error("malformed UPDATE: {0}")]
    MalformedUpdate(Box<MalformedUpdate>),
    #[error("requires MP-BGP capability")]
    NoMpBgp,
    #[error("attempting to update NLRI without next hop")]
    NoNextHop,
}

impl Error {
    /// UPDATE message error with the given subcode
    pub(crate) fn update(subcode: UpdateMessageErrorSubcode, data: Bytes) -> Self {
        Self::Malformed(NotificationErrorCode::UpdateMessageError, subcode as u8, data)
    }

    /// Attach OPEN message error codes to a component error
    pub(crate) fn in_open(self) -> Self {
        match self {
            Self::InternalType("optional parameter", _) => Self::Malformed(
                NotificationErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::UnsupportedOptionalParameter as u8,
                Bytes::new(),
            ),
            Self::InternalType(..) | Self::InternalLength(..) => {
                Self::Malformed(NotificationErrorCode::OpenMessageError, 0, Bytes::new())
            }
            other => other,
        }
    }

    /// The NOTIFICATION to send to the peer for this error
    ///
    /// `None` for errors the peer cannot be told about, such as I/O errors
    /// or a broken NOTIFICATION from the peer.
    #[must_use]
    pub fn notification(&self) -> Option<Notification> {
        use MessageHeaderErrorSubcode as Header;
        use NotificationErrorCode as Code;
        let (code, subcode, data) = match self {
            Self::Marker => (
                Code::MessageHeaderError,
                Header::ConnectionNotSynchronized as u8,
                Bytes::new(),
            ),
            Self::BadLength(len) => (
                Code::MessageHeaderError,
                Header::BadMessageLength as u8,
                Bytes::copy_from_slice(&len.to_be_bytes()),
            ),
            Self::MessageType(type_) => (
                Code::MessageHeaderError,
                Header::BadMessageType as u8,
                Bytes::copy_from_slice(&[*type_]),
            ),
            Self::Malformed(code, subcode, data) => (*code, *subcode, data.clone()),
            Self::MalformedUpdate(malformed) => match malformed.strongest() {
                Some(error) => (
                    Code::UpdateMessageError,
                    error.subcode as u8,
                    error.data.clone(),
                ),
                None => (
                    Code::UpdateMessageError,
                    UpdateMessageErrorSubcode::MalformedAttributeList as u8,
                    Bytes::new(),
                ),
            },
            Self::Io(_)
            | Self::InternalLength(..)
            | Self::InternalType(..)
            | Self::NoMpBgp
            | Self::NoNextHop => return None,
        };
        Some(Notification::new(code, subcode, data))
    }

    /// How this error should be handled if lenient error handling is allowed
    #[must_use]
    pub fn treatment(&self) -> Treatment {
        match self {
            Self::MalformedUpdate(malformed) => malformed.treatment(),
            _ => Treatment::SessionReset,
        }
    }
}

/// Error handling approaches for malformed UPDATE messages (RFC 7606 Section 2)
///
/// Ordered from the weakest to the strongest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Treatment {
    /// Drop the attribute and process the rest of the message
    AttributeDiscard,
    /// Withdraw every route carried in the message
    TreatAsWithdraw,
    /// Stop processing an address family for the rest of the session
    AfiSafiDisable,
    /// Send a NOTIFICATION and close the session
    SessionReset,
}

/// An UPDATE message with at least one malformed attribute
#[derive(Clone, Debug, PartialEq)]
pub struct MalformedUpdate {
    /// Everything that could be parsed, without the malformed attributes
    pub update: Update,
    pub errors: Vec<AttributeError>,
}

impl MalformedUpdate {
    /// The strongest treatment asked for by any of the errors
    #[must_use]
    pub fn treatment(&self) -> Treatment {
        self.errors
            .iter()
            .map(|error| error.treatment)
            .max()
            .unwrap_or(Treatment::SessionReset)
    }

    /// The error deciding the treatment
    #[must_use]
    pub fn strongest(&self) -> Option<&AttributeError> {
        self.errors.iter().max_by_key(|error| error.treatment)
    }

    /// Address families to be disabled because of malformed MP attributes
    #[must_use]
    pub fn disabled_families(&self) -> Vec<Family> {
        let mut families = Vec::new();
        for error in &self.errors {
            if error.treatment != Treatment::AfiSafiDisable {
                continue;
            }
            if let Some(family) = error.family {
                if !families.contains(&family) {
                    families.push(family);
                }
            }
        }
        families
    }
}

impl fmt::Display for MalformedUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.strongest() {
            Some(error) => write!(
                f,
                "{:?} in attribute {} ({} error(s), {:?})",
                error.subcode,
                error.type_,
                self.errors.len(),
                self.treatment()
            ),
            None => write!(f, "no attribute errors"),
        }
    }
}

/// BGP message
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification(Notification),
    Keepalive,
    RouteRefresh(RouteRefresh),
}

impl Message {
    /// The type code of this message
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Open(_) => MessageType::Open,
            Self::Update(_) => MessageType::Update,
            Self::Notification(_) => MessageType::Notification,
            Self::Keepalive => MessageType::Keepalive,
            Self::RouteRefresh(_) => MessageType::RouteRefresh,
        }
    }
}

/// BGP open message
#[derive(Clone, Debug, PartialEq)]
pub struct Open {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_id: Ipv4Addr,
    pub opt_params: OptionalParameters,
}

impl Component for Open {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        ensure_remaining!(src, 10, "OPEN");
        let version = src.get_u8();
        let asn = src.get_u16();
        let hold_time = src.get_u16();
        let bgp_id = Ipv4Addr::from(src.get_u32());
        let opt_params = OptionalParameters::from_bytes(src)?;
        Ok(Self {
            version,
            asn,
            hold_time,
            bgp_id,
            opt_params,
        })
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let mut len = 0;
        len += self.version.to_bytes(dst);
        len += self.asn.to_bytes(dst);
        len += self.hold_time.to_bytes(dst);
        len += self.bgp_id.to_bytes(dst);
        len += self.opt_params.to_bytes(dst);
        len
    }

    fn encoded_len(&self) -> usize {
        1 + 2 + 2 + 4 + self.opt_params.encoded_len()
    }
}

impl Open {
    /// Create a new BGP open message
    #[must_use]
    pub fn new_easy(
        asn: u32,
        hold_time: u16,
        bgp_id: Ipv4Addr,
        capabilities: Capabilities,
    ) -> Self {
        let oldbgp_asn = u16::try_from(asn).unwrap_or(AS_TRANS);
        Self {
            version: BGP_VERSION,
            asn: oldbgp_asn,
            hold_time,
            bgp_id,
            opt_params: vec![OptionalParameterValue::Capabilities(capabilities)].into(),
        }
    }

    /// Iterate over the capabilities of every capabilities parameter
    pub fn capabilities(&self) -> impl Iterator<Item = &capability::Value> {
        self.opt_params.iter().flat_map(|param| match param {
            OptionalParameterValue::Capabilities(cap) => cap.iter(),
        })
    }

    /// The four-octet AS number capability, if advertised
    #[must_use]
    pub fn four_octet_asn(&self) -> Option<u32> {
        self.capabilities().find_map(|cap| {
            if let capability::Value::FourOctetAsNumber(four) = cap {
                Some(four.asn)
            } else {
                None
            }
        })
    }

    /// The AS number of the speaker, preferring the four-octet capability
    #[must_use]
    pub fn speaker_asn(&self) -> u32 {
        self.four_octet_asn().unwrap_or(u32::from(self.asn))
    }
}

/// BGP update message
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    pub withdrawn_routes: Routes,
    pub path_attributes: PathAttributes,
    pub nlri: Routes,
}

impl Component for Update {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        Self::decode(src, &DecodeContext::default())
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let mut len = 0;
        let wdr_len_pos = dst.len();
        len += 0u16.to_bytes(dst); // Placeholder for withdrawn routes length
        let wdr_len = self.withdrawn_routes.to_bytes(dst);
        len += wdr_len;
        dst[wdr_len_pos..wdr_len_pos + 2].copy_from_slice(
            &(u16::try_from(wdr_len)
                .expect("Withdrawn routes length overflow")
                .to_be_bytes()),
        );
        let tpa_len_pos = dst.len();
        len += 0u16.to_bytes(dst); // Placeholder for total path attributes length
        let tpa_len = self.path_attributes.to_bytes(dst);
        len += tpa_len;
        dst[tpa_len_pos..tpa_len_pos + 2].copy_from_slice(
            &(u16::try_from(tpa_len)
                .expect("Total path attributes length overflow")
                .to_be_bytes()),
        );
        len += self.nlri.to_bytes(dst);
        len
    }

    fn encoded_len(&self) -> usize {
        2 + self.withdrawn_routes.encoded_len()
            + 2
            + self.path_attributes.encoded_len()
            + self.nlri.encoded_len()
    }
}

impl Update {
    /// Decode an UPDATE body, collecting attribute errors instead of failing
    /// on the first one (RFC 7606).
    ///
    /// Errors in the framing of the message itself are returned directly.
    /// Attribute errors are returned as [`Error::MalformedUpdate`], which
    /// still carries everything else that was parsed.
    pub fn decode(src: &mut Bytes, ctx: &DecodeContext) -> Result<Self, Error> {
        let list_error =
            || Error::update(UpdateMessageErrorSubcode::MalformedAttributeList, Bytes::new());
        let network_error =
            |_| Error::update(UpdateMessageErrorSubcode::InvalidNetworkField, Bytes::new());
        if src.remaining() < 2 {
            return Err(list_error());
        }
        let withdrawn_len = usize::from(src.get_u16());
        // Withdrawn routes and the total path attribute length
        if src.remaining() < withdrawn_len + 2 {
            return Err(list_error());
        }
        let add_path = ctx.has_path_id(Family::IPV4_UNICAST);
        let mut wdr_buf = src.split_to(withdrawn_len);
        let withdrawn_routes = Routes::decode(&mut wdr_buf, add_path).map_err(network_error)?;
        let tpa_len = usize::from(src.get_u16());
        if src.remaining() < tpa_len {
            return Err(list_error());
        }
        let mut tpa_buf = src.split_to(tpa_len);
        let nlri = Routes::decode(src, add_path).map_err(network_error)?;
        let (path_attributes, mut errors) = PathAttributes::decode(&mut tpa_buf, ctx);
        let update = Self {
            withdrawn_routes,
            path_attributes,
            nlri,
        };
        errors.extend(update.missing_attributes());
        if errors.is_empty() {
            Ok(update)
        } else {
            Err(Error::MalformedUpdate(Box::new(MalformedUpdate {
                update,
                errors,
            })))
        }
    }

    /// Mandatory well-known attributes absent from a message carrying NLRI
    fn missing_attributes(&self) -> Vec<AttributeError> {
        let has_mp_reach = self.path_attributes.get(path::Type::MpReachNlri).is_some();
        if self.nlri.is_empty() && !has_mp_reach {
            return Vec::new();
        }
        let mut required = vec![path::Type::Origin, path::Type::AsPath];
        if !self.nlri.is_empty() {
            required.push(path::Type::NextHop);
        }
        required
            .into_iter()
            .filter(|type_| self.path_attributes.get(*type_).is_none())
            .map(AttributeError::missing)
            .collect()
    }

    /// Create an End-of-RIB marker (RFC 4724 Section 2)
    #[must_use]
    pub fn end_of_rib(family: Family) -> Self {
        if family == Family::IPV4_UNICAST {
            return Self::default();
        }
        let unreach = path::MpUnreachNlri {
            afi: family.afi,
            safi: family.safi,
            withdrawn_routes: Routes::default(),
        };
        Self {
            path_attributes: PathAttributes(vec![path::Value {
                flags: path::Flags::OPTIONAL_TRANSITIVE_EXTENDED,
                data: path::Data::MpUnreachNlri(unreach),
            }]),
            ..Self::default()
        }
    }

    /// The address family this message marks the End-of-RIB of, if it is one
    #[must_use]
    pub fn end_of_rib_family(&self) -> Option<Family> {
        if !self.withdrawn_routes.is_empty() || !self.nlri.is_empty() {
            return None;
        }
        match self.path_attributes.as_slice() {
            [] => Some(Family::IPV4_UNICAST),
            [path::Value {
                data: path::Data::MpUnreachNlri(unreach),
                ..
            }] if unreach.withdrawn_routes.is_empty() => Some(Family::new(unreach.afi, unreach.safi)),
            _ => None,
        }
    }
}

/// BGP notification message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub error_code: NotificationErrorCode,
    pub error_subcode: u8,
    pub data: Bytes,
}

impl Component for Notification {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        ensure_remaining!(src, 2, "NOTIFICATION");
        let error_code = src.get_u8();
        let error_subcode = src.get_u8();
        let data = src.copy_to_bytes(src.remaining());
        Ok(Self {
            error_code: NotificationErrorCode::from_u8(error_code)
                .ok_or_else(|| Error::InternalType("error_code", u16::from(error_code)))?,
            error_subcode,
            data,
        })
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        (self.error_code as u8).to_bytes(dst);
        self.error_subcode.to_bytes(dst);
        dst.put_slice(&self.data);
        self.encoded_len()
    }

    fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }
}

impl Notification {
    /// Create a new BGP notification message
    #[must_use]
    pub const fn new(error_code: NotificationErrorCode, error_subcode: u8, data: Bytes) -> Self {
        Self {
            error_code,
            error_subcode,
            data,
        }
    }

    /// Create a CEASE notification, with a shutdown communication (RFC 9003)
    /// for the subcodes that allow one
    #[must_use]
    pub fn cease(subcode: CeaseSubcode, communication: &str) -> Self {
        let takes_text = matches!(
            subcode,
            CeaseSubcode::AdministrativeShutdown | CeaseSubcode::AdministrativeReset
        );
        let data = if takes_text && !communication.is_empty() {
            let mut end = communication.len().min(MAX_COMMUNICATION_LEN);
            while !communication.is_char_boundary(end) {
                end -= 1;
            }
            let mut data = BytesMut::with_capacity(end + 1);
            data.put_u8(u8::try_from(end).expect("Shutdown communication length overflow"));
            data.put_slice(&communication.as_bytes()[..end]);
            data.freeze()
        } else {
            Bytes::new()
        };
        Self::new(NotificationErrorCode::Cease, subcode as u8, data)
    }

    /// The shutdown communication, if this is a CEASE that carries one
    #[must_use]
    pub fn communication(&self) -> Option<String> {
        if self.error_code != NotificationErrorCode::Cease {
            return None;
        }
        if !matches!(
            CeaseSubcode::from_u8(self.error_subcode),
            Some(CeaseSubcode::AdministrativeShutdown | CeaseSubcode::AdministrativeReset)
        ) {
            return None;
        }
        let (&len, rest) = self.data.split_first()?;
        let text = rest.get(..usize::from(len))?;
        Some(String::from_utf8_lossy(text).into_owned())
    }

    /// Check if this is a CEASE asking for a hard reset (RFC 8538)
    #[must_use]
    pub fn is_hard_reset(&self) -> bool {
        self.error_code == NotificationErrorCode::Cease
            && self.error_subcode == CeaseSubcode::HardReset as u8
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sub = self.error_subcode;
        let subcode = match self.error_code {
            NotificationErrorCode::MessageHeaderError => {
                MessageHeaderErrorSubcode::from_u8(sub).map(|s| format!("{s:?}"))
            }
            NotificationErrorCode::OpenMessageError => {
                OpenMessageErrorSubcode::from_u8(sub).map(|s| format!("{s:?}"))
            }
            NotificationErrorCode::UpdateMessageError => {
                UpdateMessageErrorSubcode::from_u8(sub).map(|s| format!("{s:?}"))
            }
            NotificationErrorCode::FiniteStateMachineError => {
                FsmErrorSubcode::from_u8(sub).map(|s| format!("{s:?}"))
            }
            NotificationErrorCode::Cease => CeaseSubcode::from_u8(sub).map(|s| format!("{s:?}")),
            NotificationErrorCode::HoldTimerExpired
            | NotificationErrorCode::RouteRefreshMessageError => None,
        }
        .unwrap_or_else(|| sub.to_string());
        write!(f, "{:?}/{subcode}", self.error_code)?;
        if let Some(text) = self.communication() {
            write!(f, " \"{text}\"")?;
        }
        Ok(())
    }
}

/// BGP route refresh message (RFC 2918)
///
/// The AFI and SAFI are kept raw because a request for an unknown address
/// family must be ignored rather than treated as an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RouteRefresh {
    pub afi: u16,
    /// Reserved in RFC 2918, message subtype in RFC 7313
    pub subtype: u8,
    pub safi: u8,
}

impl Component for RouteRefresh {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        check_remaining_len!(src, 4, "ROUTE-REFRESH");
        let afi = src.get_u16();
        let subtype = src.get_u8();
        let safi = src.get_u8();
        Ok(Self { afi, subtype, safi })
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        dst.put_u16(self.afi);
        dst.put_u8(self.subtype);
        dst.put_u8(self.safi);
        self.encoded_len()
    }

    fn encoded_len(&self) -> usize {
        4
    }
}

impl RouteRefresh {
    #[must_use]
    pub const fn new(family: Family) -> Self {
        Self {
            afi: family.afi as u16,
            subtype: 0,
            safi: family.safi as u8,
        }
    }

    /// The address family asked for, if known
    #[must_use]
    pub fn family(&self) -> Option<Family> {
        Family::from_raw(self.afi, u16::from(self.safi))
    }
}

/// Notification error codes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum NotificationErrorCode {
    MessageHeaderError = 1,
    OpenMessageError = 2,
    UpdateMessageError = 3,
    HoldTimerExpired = 4,
    FiniteStateMachineError = 5,
    Cease = 6,
    RouteRefreshMessageError = 7,
}

/// Notification error subcodes for `MessageHeaderError`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum MessageHeaderErrorSubcode {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

/// Notification error subcodes for `OpenMessageError`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum OpenMessageErrorSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptableHoldTime = 6,
    UnsupportedCapability = 7,
}

/// Notification error subcodes for `UpdateMessageError`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum UpdateMessageErrorSubcode {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    AsRoutingLoop = 7,
    InvalidNextHopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

/// Notification error subcodes for `FiniteStateMachineError` (RFC 6608)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum FsmErrorSubcode {
    UnexpectedInOpenSent = 1,
    UnexpectedInOpenConfirm = 2,
    UnexpectedInEstablished = 3,
}

/// Notification error subcodes for Cease
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum CeaseSubcode {
    MaximumNumberOfPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
    HardReset = 9,
}
