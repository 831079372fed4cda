//! BGP open message optional parameters and the capability parameter
//!
//! RFC 4271 Section 4.2 specifies the optional parameters that can be included in the BGP open message.
//! However, the only optional parameter defined is the capability parameter (RFC 3392/5492), so both are
//! implemented in this module.

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::endec::Component;
use super::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// A list of BGP optional parameters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptionalParameters(pub Vec<OptionalParameterValue>);

impl Component for OptionalParameters {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        // RFC 4271 4.2 Optional Parameters Length
        ensure_remaining!(src, 1, "optional parameter length");
        let mut len = usize::from(src.get_u8());
        // RFC 9072 2. Non-Ext OP Len and Non-Ext OP Type both 255
        let extended = len == usize::from(u8::MAX) && src.first() == Some(&u8::MAX);
        if extended {
            ensure_remaining!(src, 3, "extended optional parameter length");
            src.advance(1);
            len = usize::from(src.get_u16());
        }
        check_remaining_len!(src, len, "optional parameter length");
        let mut opt_params = Vec::new();
        // RFC 4271 4.2 Optional Parameters
        while src.has_remaining() {
            let param = OptionalParameterValue::decode(src, extended)?;
            opt_params.push(param);
        }
        Ok(Self(opt_params))
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let extended = self.is_extended();
        let length_pos = dst.len();
        if extended {
            dst.put_u8(u8::MAX); // Non-Ext OP Len
            dst.put_u8(u8::MAX); // Non-Ext OP Type
        }
        dst.put_u8(0); // Placeholder for length
        if extended {
            dst.put_u8(0);
        }
        let mut len = 0;
        for param in self.0 {
            len += param.encode(dst, extended);
        }
        if extended {
            let len = u16::try_from(len).expect("Extended optional parameters length overflow");
            dst[length_pos + 2..length_pos + 4].copy_from_slice(&len.to_be_bytes());
            usize::from(len) + 4
        } else {
            // Checked by `is_extended`
            dst[length_pos] = len as u8;
            len + 1 // Length
        }
    }

    fn encoded_len(&self) -> usize {
        let (header, param_header) = if self.is_extended() { (4, 3) } else { (1, 2) };
        self.0
            .iter()
            .map(|param| param.body_len() + param_header)
            .sum::<usize>()
            + header
    }
}

impl OptionalParameters {
    /// Whether the parameters only fit the extended encoding (RFC 9072)
    ///
    /// This happens when many families are configured together with
    /// graceful restart and ADD-PATH.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.0.iter().map(|param| param.body_len() + 2).sum::<usize>() > usize::from(u8::MAX)
    }
}

impl From<Vec<OptionalParameterValue>> for OptionalParameters {
    fn from(params: Vec<OptionalParameterValue>) -> Self {
        Self(params)
    }
}

impl Deref for OptionalParameters {
    type Target = Vec<OptionalParameterValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// BGP optional parameter (RFC 4271 4.2)
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum OptionalParameterValue {
    Capabilities(Capabilities),
}

/// BGP optional parameter types
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum OptionalParameterType {
    Capabilities = 2,
}

impl OptionalParameterValue {
    /// Decode one parameter, with a two-octet length if `extended`
    fn decode(src: &mut Bytes, extended: bool) -> Result<Self, Error> {
        ensure_remaining!(src, 2, "optional parameter header");
        // RFC 5492 4. Optional Parameters -> Parameter Type
        let param_type = src.get_u8();
        // RFC 5492 4. Optional Parameters -> Parameter Length
        let param_len = if extended {
            ensure_remaining!(src, 2, "optional parameter header");
            usize::from(src.get_u16())
        } else {
            usize::from(src.get_u8())
        };
        ensure_remaining!(src, param_len, "optional parameter");
        let mut src = src.split_to(param_len);
        match OptionalParameterType::from_u8(param_type) {
            Some(OptionalParameterType::Capabilities) => {
                let cap = Capabilities::from_bytes(&mut src)?;
                Ok(Self::Capabilities(cap))
            }
            _ => Err(Error::InternalType(
                "optional parameter",
                u16::from(param_type),
            )),
        }
    }

    /// Encode one parameter, with a two-octet length if `extended`
    fn encode(self, dst: &mut BytesMut, extended: bool) -> usize {
        let header_len = if extended { 3 } else { 2 };
        let type_pos = dst.len();
        dst.put_u8(0); // Placeholder for type
        let len_pos = dst.len();
        dst.put_bytes(0, header_len - 1); // Placeholder for length
        match self {
            OptionalParameterValue::Capabilities(cap) => {
                let len = cap.to_bytes(dst);
                dst[type_pos] = OptionalParameterType::Capabilities as u8;
                if extended {
                    let len = u16::try_from(len).expect("Capabilities length overflow");
                    dst[len_pos..len_pos + 2].copy_from_slice(&len.to_be_bytes());
                } else {
                    // The caller chose the short form because this fits
                    dst[len_pos] = len as u8;
                }
                len + header_len
            }
        }
    }

    fn body_len(&self) -> usize {
        match self {
            OptionalParameterValue::Capabilities(cap) => cap.encoded_len(),
        }
    }
}

impl Component for OptionalParameterValue {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        Self::decode(src, false)
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        self.encode(dst, false)
    }

    fn encoded_len(&self) -> usize {
        self.body_len() + 2 // Type and length
    }
}

/// BGP capability
// "a BGP speaker MUST be prepared to accept such multiple instances," so a Vec must be used
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(Vec<Value>);

impl Component for Capabilities {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut cap = Vec::new();
        while src.has_remaining() {
            ensure_remaining!(src, 2, "capability header");
            // RFC 5492 4. Optional Parameters -> Capability Code
            let code = src.get_u8();
            // RFC 5492 4. Optional Parameters -> Capability Length
            let len = usize::from(src.get_u8());
            ensure_remaining!(src, len, "capability");
            // Avoid processing trailing bytes
            let raw = src.split_to(len);
            let mut body = raw.clone();
            log::trace!("Capability code: {code}, length: {len}, data: {raw:?}");
            let decoded = match Type::from_u8(code) {
                Some(Type::MultiProtocol) => {
                    MultiProtocol::from_bytes(&mut body).map(Value::MultiProtocol)
                }
                Some(Type::RouteRefresh) => Ok(Value::RouteRefresh),
                Some(Type::ExtendedNextHop) => {
                    ExtendedNextHop::from_bytes(&mut body).map(Value::ExtendedNextHop)
                }
                Some(Type::ExtendedMessage) => Ok(Value::ExtendedMessage),
                Some(Type::GracefulRestart) => {
                    GracefulRestart::from_bytes(&mut body).map(Value::GracefulRestart)
                }
                Some(Type::FourOctetAsNumber) => u32::from_bytes(&mut body)
                    .map(|asn| Value::FourOctetAsNumber(FourOctetAsNumber { asn })),
                Some(Type::AddPath) => AddPath::from_bytes(&mut body).map(Value::AddPath),
                Some(Type::LongLivedGracefulRestart) => LongLivedGracefulRestart::from_bytes(
                    &mut body,
                )
                .map(Value::LongLivedGracefulRestart),
                Some(Type::Fqdn) => Fqdn::from_bytes(&mut body).map(Value::Fqdn),
                None => Ok(Value::Unsupported(code, body.split_off(0))),
            };
            let value = match decoded {
                Ok(_) if body.has_remaining() => {
                    return Err(Error::InternalLength(
                        "capability",
                        std::cmp::Ordering::Greater,
                    ));
                }
                Ok(value) => value,
                // A known capability about something we do not know, like an unknown AFI
                Err(Error::InternalType(what, value)) => {
                    log::debug!("Keeping capability {code} opaque because of {what} {value}");
                    Value::Unsupported(code, raw)
                }
                Err(e) => return Err(e),
            };
            cap.push(value);
        }
        Ok(Self(cap))
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let mut len = 0;
        for value in self.0 {
            dst.put_u8((&value).into());
            let len_pos = dst.len();
            dst.put_u8(0); // Placeholder for length
            let value_len = match value {
                Value::MultiProtocol(mp) => mp.to_bytes(dst),
                Value::RouteRefresh | Value::ExtendedMessage => 0,
                Value::ExtendedNextHop(enh) => enh.to_bytes(dst),
                Value::GracefulRestart(gr) => gr.to_bytes(dst),
                Value::FourOctetAsNumber(four) => four.asn.to_bytes(dst),
                Value::AddPath(add_path) => add_path.to_bytes(dst),
                Value::LongLivedGracefulRestart(llgr) => llgr.to_bytes(dst),
                Value::Fqdn(fqdn) => fqdn.to_bytes(dst),
                Value::Unsupported(_, data) => {
                    dst.put_slice(&data);
                    data.len()
                }
            };
            dst[len_pos] = u8::try_from(value_len).expect("Capability length overflow");
            len += value_len + 2; // Code and length
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0
            .iter()
            .map(|v| {
                let len = match v {
                    Value::MultiProtocol(mp) => mp.encoded_len(),
                    Value::RouteRefresh | Value::ExtendedMessage => 0,
                    Value::ExtendedNextHop(enh) => enh.encoded_len(),
                    Value::GracefulRestart(gr) => gr.encoded_len(),
                    Value::FourOctetAsNumber(_) => 4,
                    Value::AddPath(add_path) => add_path.encoded_len(),
                    Value::LongLivedGracefulRestart(llgr) => llgr.encoded_len(),
                    Value::Fqdn(fqdn) => fqdn.encoded_len(),
                    Value::Unsupported(_, data) => data.len(),
                };
                len + 2 // Code and length
            })
            .sum()
    }
}

impl From<Vec<Value>> for Capabilities {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl Deref for Capabilities {
    type Target = Vec<Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Capabilities {
    /// Check if a specific capability is present
    #[must_use]
    pub fn has(&self, cap: &Value) -> bool {
        self.0.iter().any(|v| *v == *cap)
    }

    /// Check if a multi-protocol capability for `family` is present
    #[must_use]
    pub fn has_multi_protocol(&self, family: Family) -> bool {
        self.has(&Value::MultiProtocol(family.into()))
    }

    /// Check if route refresh capability is present
    #[must_use]
    pub fn has_route_refresh(&self) -> bool {
        self.has(&Value::RouteRefresh)
    }

    /// Check if an extended next hop capability is present
    #[must_use]
    pub fn has_extended_next_hop(&self, afi: Afi, safi: Safi, next_hop_afi: Afi) -> bool {
        let looking_for = ExtendedNextHopValue {
            afi,
            safi,
            next_hop_afi,
        };
        self.0.iter().any(|v| {
            // Find the extended next hop capability
            if let Value::ExtendedNextHop(enh) = v {
                enh.0.iter().any(|v| *v == looking_for)
            } else {
                false
            }
        })
    }
}

/// BGP capability (RFC 3392/5492)
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Value {
    /// BGP multi-protocol capability (RFC 2858)
    MultiProtocol(MultiProtocol),
    /// BGP route refresh capability (RFC 2918)
    RouteRefresh,
    /// BGP extended next hop capability (RFC 8950)
    ExtendedNextHop(ExtendedNextHop),
    /// BGP extended message capability (RFC 8654)
    ExtendedMessage,
    /// BGP graceful restart capability (RFC 4724)
    GracefulRestart(GracefulRestart),
    /// BGP four-octet AS number capability (RFC 6793)
    FourOctetAsNumber(FourOctetAsNumber),
    /// BGP ADD-PATH capability (RFC 7911)
    AddPath(AddPath),
    /// BGP long-lived graceful restart capability (RFC 9494)
    LongLivedGracefulRestart(LongLivedGracefulRestart),
    /// BGP FQDN capability (draft-walton-bgp-hostname-capability)
    Fqdn(Fqdn),
    /// Other unsupported capability
    Unsupported(u8, Bytes),
}

impl Value {
    /// Capability code of this value
    #[must_use]
    pub fn code(&self) -> u8 {
        self.into()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum Type {
    MultiProtocol = 1,
    RouteRefresh = 2,
    ExtendedNextHop = 5,
    ExtendedMessage = 6,
    GracefulRestart = 64,
    FourOctetAsNumber = 65,
    AddPath = 69,
    LongLivedGracefulRestart = 71,
    Fqdn = 73,
}

impl From<&Value> for u8 {
    fn from(cap: &Value) -> Self {
        match cap {
            Value::MultiProtocol(_) => Type::MultiProtocol as u8,
            Value::RouteRefresh => Type::RouteRefresh as u8,
            Value::ExtendedNextHop(_) => Type::ExtendedNextHop as u8,
            Value::ExtendedMessage => Type::ExtendedMessage as u8,
            Value::GracefulRestart(_) => Type::GracefulRestart as u8,
            Value::FourOctetAsNumber(_) => Type::FourOctetAsNumber as u8,
            Value::AddPath(_) => Type::AddPath as u8,
            Value::LongLivedGracefulRestart(_) => Type::LongLivedGracefulRestart as u8,
            Value::Fqdn(_) => Type::Fqdn as u8,
            Value::Unsupported(code, _) => *code,
        }
    }
}

/// BGP multi-protocol capability value field (RFC 2858 Section 7)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MultiProtocol {
    pub afi: Afi,
    pub safi: Safi,
}

impl Component for MultiProtocol {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        check_remaining_len!(src, 4, "MultiProtocol");
        let afi = src.get_u16();
        let afi = Afi::from_u16(afi).ok_or(Error::InternalType("MultiProtocol AFI", afi))?;
        let _ = src.get_u8(); // Reserved
        let safi = src.get_u8().into();
        let safi = Safi::from_u16(safi).ok_or(Error::InternalType("MultiProtocol SAFI", safi))?;
        Ok(Self { afi, safi })
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        dst.put_u16(self.afi as u16);
        dst.put_u8(0); // Reserved
        dst.put_u8(self.safi as u8);
        self.encoded_len()
    }

    fn encoded_len(&self) -> usize {
        4
    }
}

impl From<Family> for MultiProtocol {
    fn from(family: Family) -> Self {
        Self {
            afi: family.afi,
            safi: family.safi,
        }
    }
}

impl From<MultiProtocol> for Family {
    fn from(mp: MultiProtocol) -> Self {
        Self::new(mp.afi, mp.safi)
    }
}

/// BGP address family identifier
///
/// # References
/// [Address Family Numbers](https://www.iana.org/assignments/address-family-numbers/address-family-numbers.xhtml)
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Primitive)]
#[non_exhaustive]
#[repr(u16)]
pub enum Afi {
    Ipv4 = 1,
    Ipv6 = 2,
}

/// BGP subsequent address family identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Primitive)]
#[non_exhaustive]
#[repr(u16)]
pub enum Safi {
    Unicast = 1,
    Multicast = 2,
    MplsLabel = 4,
    Vpn = 128,
    VpnMulticast = 129,
}

/// An address family: AFI and SAFI together
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Family {
    pub afi: Afi,
    pub safi: Safi,
}

/// Configuration names of the families that can be configured
const FAMILY_NAMES: [(Family, &str); 6] = [
    (Family::IPV4_UNICAST, "ipv4-unicast"),
    (Family::IPV6_UNICAST, "ipv6-unicast"),
    (Family::IPV4_MULTICAST, "ipv4-multicast"),
    (Family::IPV6_MULTICAST, "ipv6-multicast"),
    (Family::IPV4_LABELLED_UNICAST, "ipv4-labelled-unicast"),
    (Family::IPV6_LABELLED_UNICAST, "ipv6-labelled-unicast"),
];

impl Family {
    pub const IPV4_UNICAST: Self = Self::new(Afi::Ipv4, Safi::Unicast);
    pub const IPV6_UNICAST: Self = Self::new(Afi::Ipv6, Safi::Unicast);
    pub const IPV4_MULTICAST: Self = Self::new(Afi::Ipv4, Safi::Multicast);
    pub const IPV6_MULTICAST: Self = Self::new(Afi::Ipv6, Safi::Multicast);
    pub const IPV4_LABELLED_UNICAST: Self = Self::new(Afi::Ipv4, Safi::MplsLabel);
    pub const IPV6_LABELLED_UNICAST: Self = Self::new(Afi::Ipv6, Safi::MplsLabel);

    #[must_use]
    pub const fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }

    /// Look up a family from its numbers
    #[must_use]
    pub fn from_raw(afi: u16, safi: u16) -> Option<Self> {
        Some(Self::new(Afi::from_u16(afi)?, Safi::from_u16(safi)?))
    }

    /// Decode the AFI, a reserved octet if `wide_safi`, and the SAFI
    ///
    /// Returns `None` for families we do not know about, after consuming them.
    fn decode(src: &mut Bytes, wide_safi: bool) -> Result<Option<Self>, Error> {
        ensure_remaining!(src, if wide_safi { 4 } else { 3 }, "AFI/SAFI");
        let afi = src.get_u16();
        let safi = if wide_safi {
            src.get_u16()
        } else {
            u16::from(src.get_u8())
        };
        let family = Self::from_raw(afi, safi);
        if family.is_none() {
            log::debug!("Skipping unknown address family {afi}/{safi}");
        }
        Ok(family)
    }

    fn encode(self, dst: &mut BytesMut, wide_safi: bool) -> usize {
        dst.put_u16(self.afi as u16);
        if wide_safi {
            dst.put_u16(self.safi as u16);
            4
        } else {
            dst.put_u8(self.safi as u8);
            3
        }
    }
}

impl Default for Family {
    fn default() -> Self {
        Self::IPV4_UNICAST
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match FAMILY_NAMES.iter().find(|(family, _)| family == self) {
            Some((_, name)) => f.write_str(name),
            None => write!(f, "{:?}-{:?}", self.afi, self.safi),
        }
    }
}

/// Error for an address family name that is not known
#[derive(Debug, thiserror::Error)]
#[error("unknown address family {0}")]
pub struct UnknownFamily(pub String);

impl FromStr for Family {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FAMILY_NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s))
            .map(|(family, _)| *family)
            .ok_or_else(|| UnknownFamily(s.to_string()))
    }
}

#[cfg(feature = "impl-serde")]
impl serde::Serialize for Family {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "impl-serde")]
impl<'de> serde::Deserialize<'de> for Family {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// BGP extended next hop capability (RFC 8950)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtendedNextHop(pub Vec<ExtendedNextHopValue>);

impl From<Vec<ExtendedNextHopValue>> for ExtendedNextHop {
    fn from(values: Vec<ExtendedNextHopValue>) -> Self {
        Self(values)
    }
}

impl Deref for ExtendedNextHop {
    type Target = Vec<ExtendedNextHopValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// BGP extended next hop value field (RFC 8950)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtendedNextHopValue {
    pub afi: Afi,
    pub safi: Safi,
    pub next_hop_afi: Afi,
}

impl Component for ExtendedNextHop {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut values = Vec::with_capacity(src.len() / 6);
        while src.has_remaining() {
            let family = Family::decode(src, true)?;
            ensure_remaining!(src, 2, "ExtendedNextHop NextHop AFI");
            let next_hop_afi = src.get_u16();
            let (Some(family), Some(next_hop_afi)) = (family, Afi::from_u16(next_hop_afi)) else {
                continue;
            };
            values.push(ExtendedNextHopValue {
                afi: family.afi,
                safi: family.safi,
                next_hop_afi,
            });
        }
        Ok(Self(values))
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let len = self.encoded_len();
        for value in self.0 {
            Family::new(value.afi, value.safi).encode(dst, true);
            dst.put_u16(value.next_hop_afi as u16);
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0.len() * 6
    }
}

/// BGP four-octet AS number capability value field (RFC 6793)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FourOctetAsNumber {
    pub asn: u32,
}

impl From<u32> for FourOctetAsNumber {
    fn from(asn: u32) -> Self {
        Self { asn }
    }
}

impl Deref for FourOctetAsNumber {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.asn
    }
}

/// BGP graceful restart capability value field (RFC 4724 Section 3)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GracefulRestart {
    /// Restart State (R) bit
    pub restarting: bool,
    /// Graceful Notification (N) bit (RFC 8538)
    pub notification: bool,
    /// Restart time in seconds, 12 bits
    pub restart_time: u16,
    pub tuples: Vec<GracefulRestartTuple>,
}

/// Per-family part of the graceful restart capability
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GracefulRestartTuple {
    pub family: Family,
    /// Forwarding State (F) bit
    pub forwarding: bool,
}

impl GracefulRestart {
    const RESTARTING: u16 = 0x8000;
    const NOTIFICATION: u16 = 0x4000;
    const TIME_MASK: u16 = 0x0fff;
    const FORWARDING: u8 = 0x80;

    /// The tuple for `family`, if advertised
    #[must_use]
    pub fn family(&self, family: Family) -> Option<&GracefulRestartTuple> {
        self.tuples.iter().find(|tuple| tuple.family == family)
    }
}

impl Component for GracefulRestart {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        ensure_remaining!(src, 2, "GracefulRestart flags");
        let flags_time = src.get_u16();
        let mut tuples = Vec::with_capacity(src.len() / 4);
        while src.has_remaining() {
            let family = Family::decode(src, false)?;
            ensure_remaining!(src, 1, "GracefulRestart tuple flags");
            let flags = src.get_u8();
            if let Some(family) = family {
                tuples.push(GracefulRestartTuple {
                    family,
                    forwarding: flags & Self::FORWARDING != 0,
                });
            }
        }
        Ok(Self {
            restarting: flags_time & Self::RESTARTING != 0,
            notification: flags_time & Self::NOTIFICATION != 0,
            restart_time: flags_time & Self::TIME_MASK,
            tuples,
        })
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let len = self.encoded_len();
        let mut flags_time = self.restart_time & Self::TIME_MASK;
        if self.restarting {
            flags_time |= Self::RESTARTING;
        }
        if self.notification {
            flags_time |= Self::NOTIFICATION;
        }
        dst.put_u16(flags_time);
        for tuple in self.tuples {
            tuple.family.encode(dst, false);
            dst.put_u8(if tuple.forwarding { Self::FORWARDING } else { 0 });
        }
        len
    }

    fn encoded_len(&self) -> usize {
        2 + self.tuples.len() * 4
    }
}

/// Whether path identifiers are received and/or sent for a family (RFC 7911)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AddPathMode {
    pub receive: bool,
    pub send: bool,
}

impl AddPathMode {
    const RECEIVE: u8 = 1;
    const SEND: u8 = 2;

    /// Decode the Send/Receive field
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits == 0 || bits > Self::RECEIVE | Self::SEND {
            return None;
        }
        Some(Self {
            receive: bits & Self::RECEIVE != 0,
            send: bits & Self::SEND != 0,
        })
    }

    /// Encode the Send/Receive field
    #[must_use]
    pub const fn bits(self) -> u8 {
        let mut bits = 0;
        if self.receive {
            bits |= Self::RECEIVE;
        }
        if self.send {
            bits |= Self::SEND;
        }
        bits
    }

    /// Check if neither direction is enabled
    #[must_use]
    pub const fn is_none(self) -> bool {
        !self.receive && !self.send
    }
}

/// Per-family part of the ADD-PATH capability
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddPathTuple {
    pub family: Family,
    pub mode: AddPathMode,
}

/// BGP ADD-PATH capability value field (RFC 7911 Section 4)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddPath(pub Vec<AddPathTuple>);

impl Deref for AddPath {
    type Target = Vec<AddPathTuple>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Component for AddPath {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut tuples = Vec::with_capacity(src.len() / 4);
        while src.has_remaining() {
            let family = Family::decode(src, false)?;
            ensure_remaining!(src, 1, "ADD-PATH Send/Receive");
            let bits = src.get_u8();
            let Some(mode) = AddPathMode::from_bits(bits) else {
                log::debug!("Ignoring ADD-PATH tuple with Send/Receive {bits}");
                continue;
            };
            if let Some(family) = family {
                tuples.push(AddPathTuple { family, mode });
            }
        }
        Ok(Self(tuples))
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let len = self.encoded_len();
        for tuple in self.0 {
            tuple.family.encode(dst, false);
            dst.put_u8(tuple.mode.bits());
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0.len() * 4
    }
}

/// Per-family part of the long-lived graceful restart capability
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LlgrTuple {
    pub family: Family,
    pub forwarding: bool,
    /// Long-lived stale time in seconds, 24 bits
    pub stale_time: u32,
}

/// BGP long-lived graceful restart capability value field (RFC 9494 Section 4.1)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LongLivedGracefulRestart(pub Vec<LlgrTuple>);

impl Deref for LongLivedGracefulRestart {
    type Target = Vec<LlgrTuple>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl LongLivedGracefulRestart {
    const FORWARDING: u8 = 0x80;
    /// Largest stale time that fits in 24 bits
    pub const MAX_STALE_TIME: u32 = 0x00ff_ffff;

    /// The tuple for `family`, if advertised
    #[must_use]
    pub fn family(&self, family: Family) -> Option<&LlgrTuple> {
        self.0.iter().find(|tuple| tuple.family == family)
    }
}

impl Component for LongLivedGracefulRestart {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut tuples = Vec::with_capacity(src.len() / 7);
        while src.has_remaining() {
            let family = Family::decode(src, false)?;
            ensure_remaining!(src, 4, "LLGR tuple");
            let flags = src.get_u8();
            // `get_uint` reads big-endian, just like the wire
            #[allow(clippy::cast_possible_truncation)]
            let stale_time = src.get_uint(3) as u32;
            if let Some(family) = family {
                tuples.push(LlgrTuple {
                    family,
                    forwarding: flags & Self::FORWARDING != 0,
                    stale_time,
                });
            }
        }
        Ok(Self(tuples))
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let len = self.encoded_len();
        for tuple in self.0 {
            tuple.family.encode(dst, false);
            dst.put_u8(if tuple.forwarding { Self::FORWARDING } else { 0 });
            dst.put_uint(u64::from(tuple.stale_time.min(Self::MAX_STALE_TIME)), 3);
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0.len() * 7
    }
}

/// BGP FQDN capability value field
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fqdn {
    pub hostname: String,
    pub domain: String,
}

impl Fqdn {
    /// Longest host or domain name that is advertised
    pub const MAX_LEN: usize = 64;

    /// Create the capability, cutting names that are too long
    #[must_use]
    pub fn new(hostname: &str, domain: &str) -> Self {
        Self {
            hostname: truncate(hostname, Self::MAX_LEN).to_string(),
            domain: truncate(domain, Self::MAX_LEN).to_string(),
        }
    }
}

/// Cut `s` to at most `max` bytes without splitting a character
fn truncate(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl Component for Fqdn {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut read_name = |name| {
            ensure_remaining!(src, 1, name);
            let len = usize::from(src.get_u8());
            ensure_remaining!(src, len, name);
            Ok(String::from_utf8_lossy(&src.split_to(len)).into_owned())
        };
        let hostname = read_name("FQDN hostname")?;
        let domain = read_name("FQDN domain")?;
        Ok(Self { hostname, domain })
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let len = self.encoded_len();
        for name in [self.hostname, self.domain] {
            dst.put_u8(u8::try_from(name.len()).expect("FQDN name length overflow"));
            dst.put_slice(name.as_bytes());
        }
        len
    }

    fn encoded_len(&self) -> usize {
        2 + self.hostname.len() + self.domain.len()
    }
}

/// Builder for BGP capabilities
#[derive(Debug, Default)]
pub struct CapabilitiesBuilder {
    data: Vec<Value>,
}

impl CapabilitiesBuilder {
    /// Create a new capabilities builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a multi-protocol capability
    #[must_use]
    pub fn multi_protocol(mut self, afi: Afi, safi: Safi) -> Self {
        self.data
            .push(Value::MultiProtocol(MultiProtocol { afi, safi }));
        self
    }

    /// Shortcut for adding an IPv4 unicast multi-protocol capability
    #[must_use]
    pub fn mp_ipv4_unicast(self) -> Self {
        self.multi_protocol(Afi::Ipv4, Safi::Unicast)
    }

    /// Shortcut for adding an IPv6 unicast multi-protocol capability
    #[must_use]
    pub fn mp_ipv6_unicast(self) -> Self {
        self.multi_protocol(Afi::Ipv6, Safi::Unicast)
    }

    /// Add a route refresh capability
    #[must_use]
    pub fn route_refresh(mut self) -> Self {
        self.data.push(Value::RouteRefresh);
        self
    }

    /// Add extended next hop values
    ///
    /// Values are merged into the first extended next hop capability added.
    #[must_use]
    pub fn extended_next_hop(mut self, value: ExtendedNextHop) -> Self {
        let existing = self.data.iter_mut().find_map(|v| {
            if let Value::ExtendedNextHop(enh) = v {
                Some(enh)
            } else {
                None
            }
        });
        match existing {
            Some(enh) => enh.0.extend(value.0),
            None => self.data.push(Value::ExtendedNextHop(value)),
        }
        self
    }

    /// Shortcut for adding a IPv4-over-IPv6 extended next hop capability
    #[must_use]
    pub fn enh_ipv4_over_ipv6(self) -> Self {
        self.extended_next_hop(ExtendedNextHop(vec![ExtendedNextHopValue {
            afi: Afi::Ipv4,
            safi: Safi::Unicast,
            next_hop_afi: Afi::Ipv6,
        }]))
    }

    /// Add a four-octet AS number capability
    #[must_use]
    pub fn four_octet_as_number(mut self, asn: u32) -> Self {
        self.data
            .push(Value::FourOctetAsNumber(FourOctetAsNumber { asn }));
        self
    }

    /// Add a graceful restart capability
    #[must_use]
    pub fn graceful_restart(mut self, value: GracefulRestart) -> Self {
        self.data.push(Value::GracefulRestart(value));
        self
    }

    /// Add a long-lived graceful restart capability
    #[must_use]
    pub fn long_lived_graceful_restart(mut self, tuples: Vec<LlgrTuple>) -> Self {
        self.data
            .push(Value::LongLivedGracefulRestart(LongLivedGracefulRestart(tuples)));
        self
    }

    /// Add an ADD-PATH capability
    #[must_use]
    pub fn add_path(mut self, tuples: Vec<AddPathTuple>) -> Self {
        self.data.push(Value::AddPath(AddPath(tuples)));
        self
    }

    /// Add an FQDN capability
    #[must_use]
    pub fn fqdn(mut self, hostname: &str, domain: &str) -> Self {
        self.data.push(Value::Fqdn(Fqdn::new(hostname, domain)));
        self
    }

    /// Add an unsupported capability
    #[must_use]
    pub fn other(mut self, code: u8, data: Bytes) -> Self {
        self.data.push(Value::Unsupported(code, data));
        self
    }

    /// Build the capabilities
    #[must_use]
    pub fn build(self) -> Capabilities {
        Capabilities(self.data)
    }
}
