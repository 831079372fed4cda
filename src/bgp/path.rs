//! BGP path attributes (RFC 4271 Section 4.3)

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::{
    capability::{Afi, Family, Safi},
    endec::{Component, DecodeContext},
    route::Routes,
    Error, Treatment, UpdateMessageErrorSubcode, AS_TRANS,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::Deref,
};

/// BGP path attributes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct PathAttributes(pub Vec<Value>);

impl Component for PathAttributes {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let (attributes, errors) = Self::decode(src, &DecodeContext::default());
        match errors.into_iter().max_by_key(|e| e.treatment) {
            Some(error) => Err(Error::update(error.subcode, error.data)),
            None => Ok(attributes),
        }
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let mut len = 0;
        for attribute in self.0 {
            len += attribute.to_bytes(dst);
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0.iter().map(Value::encoded_len).sum()
    }
}

impl Deref for PathAttributes {
    type Target = Vec<Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PathAttributes {
    /// Decode attributes, leaving out and reporting the malformed ones
    /// instead of giving up on the first error (RFC 7606 Section 3)
    pub fn decode(src: &mut Bytes, ctx: &DecodeContext) -> (Self, Vec<AttributeError>) {
        let mut attributes = Vec::new();
        let mut errors = Vec::new();
        let mut seen = [false; 256];
        while src.has_remaining() {
            let Some((flags, type_, mut body)) = Self::split_attribute(src) else {
                // Nothing after a broken length can be trusted
                errors.push(AttributeError::list());
                break;
            };
            let is_mp = matches!(
                Type::from_u8(type_),
                Some(Type::MpReachNlri | Type::MpUnreachNlri)
            );
            if seen[usize::from(type_)] {
                log::debug!("Duplicate path attribute {type_}");
                if is_mp {
                    errors.push(AttributeError {
                        type_,
                        subcode: UpdateMessageErrorSubcode::MalformedAttributeList,
                        treatment: Treatment::SessionReset,
                        data: Bytes::new(),
                        family: None,
                    });
                }
                continue;
            }
            seen[usize::from(type_)] = true;
            let family = if is_mp && body.len() >= 3 {
                Family::from_raw(u16::from_be_bytes([body[0], body[1]]), u16::from(body[2]))
            } else {
                None
            };
            let raw = body.clone();
            match Data::decode(type_, flags, &mut body, ctx) {
                Ok(data) => attributes.push(Value { flags, data }),
                Err(subcode) => {
                    log::debug!("Malformed path attribute {type_}: {subcode:?}");
                    errors.push(AttributeError::new(type_, subcode, raw, family));
                }
            }
        }
        (Self(attributes), errors)
    }

    /// Split one attribute off the buffer
    fn split_attribute(src: &mut Bytes) -> Option<(Flags, u8, Bytes)> {
        if src.remaining() < 3 {
            return None;
        }
        let flags = Flags(src.get_u8());
        let type_ = src.get_u8();
        let len = if flags.is_extended_length() {
            if src.remaining() < 2 {
                return None;
            }
            usize::from(src.get_u16())
        } else {
            usize::from(src.get_u8())
        };
        if src.remaining() < len {
            return None;
        }
        Some((flags, type_, src.split_to(len)))
    }

    /// Find the first attribute of a type
    #[must_use]
    pub fn get(&self, type_: Type) -> Option<&Value> {
        self.0.iter().find(|attr| u8::from(&attr.data) == type_ as u8)
    }

    /// Remove every attribute of a type
    pub fn remove(&mut self, type_: Type) {
        self.0.retain(|attr| u8::from(&attr.data) != type_ as u8);
    }

    /// The AS_PATH, if present
    #[must_use]
    pub fn as_path(&self) -> Option<&AsPath> {
        self.0.iter().find_map(|attr| {
            if let Data::AsPath(path) = &attr.data {
                Some(path)
            } else {
                None
            }
        })
    }

    /// Rebuild the real AS_PATH and AGGREGATOR from the AS4 attributes sent
    /// by a speaker without four-octet AS support (RFC 6793 Section 4.2.3)
    pub fn merge_as4(&mut self) {
        let as4_path = self.0.iter().find_map(|attr| match &attr.data {
            Data::As4Path(path) => Some(path.clone()),
            _ => None,
        });
        let as4_aggregator = self.0.iter().find_map(|attr| match &attr.data {
            Data::As4Aggregator(agg) => Some(*agg),
            _ => None,
        });
        self.0
            .retain(|attr| !matches!(attr.data, Data::As4Path(_) | Data::As4Aggregator(_)));
        let mut use_as4_path = true;
        for attr in &mut self.0 {
            if let Data::Aggregator(agg) = &mut attr.data {
                match as4_aggregator {
                    Some(as4) if agg.asn == u32::from(AS_TRANS) => *agg = as4,
                    // The AS4_PATH is from before this aggregation
                    Some(_) => use_as4_path = false,
                    None => {}
                }
            }
        }
        if !use_as4_path {
            return;
        }
        if let Some(as4_path) = as4_path {
            for attr in &mut self.0 {
                if let Data::AsPath(path) = &mut attr.data {
                    path.merge_as4(as4_path);
                    break;
                }
            }
        }
    }

    /// Prepare AS numbers for a peer with or without four-octet AS support
    /// (RFC 6793 Section 4.2.2)
    pub fn set_four_octet_as(&mut self, four_octet: bool) {
        self.0
            .retain(|attr| !matches!(attr.data, Data::As4Path(_) | Data::As4Aggregator(_)));
        let mut as4_path = None;
        let mut as4_aggregator = None;
        for attr in &mut self.0 {
            match &mut attr.data {
                Data::AsPath(path) if four_octet => path.set_as4(true),
                Data::Aggregator(agg) if four_octet => agg.as4 = true,
                Data::AsPath(path) => {
                    if path.has_as4_asn() {
                        as4_path = Some(path.as4_path());
                    }
                    path.to_two_octet();
                }
                Data::Aggregator(agg) => {
                    if agg.asn > u32::from(u16::MAX) {
                        as4_aggregator = Some(Aggregator { as4: true, ..*agg });
                        agg.asn = u32::from(AS_TRANS);
                    }
                    agg.as4 = false;
                }
                _ => {}
            }
        }
        if let Some(path) = as4_path {
            self.0.push(Value {
                flags: Flags::OPTIONAL_TRANSITIVE,
                data: Data::As4Path(path),
            });
        }
        if let Some(agg) = as4_aggregator {
            self.0.push(Value {
                flags: Flags::OPTIONAL_TRANSITIVE,
                data: Data::As4Aggregator(agg),
            });
        }
    }
}

/// A malformed attribute found while decoding an UPDATE
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeError {
    /// Attribute type code
    pub type_: u8,
    pub subcode: UpdateMessageErrorSubcode,
    pub treatment: Treatment,
    /// Data for the NOTIFICATION
    pub data: Bytes,
    /// Address family of a malformed MP_REACH_NLRI or MP_UNREACH_NLRI
    pub family: Option<Family>,
}

impl AttributeError {
    /// Classify an error by the attribute it happened in (RFC 7606 Section 7)
    fn new(type_: u8, subcode: UpdateMessageErrorSubcode, data: Bytes, family: Option<Family>) -> Self {
        let treatment = match Type::from_u8(type_) {
            Some(
                Type::Origin
                | Type::AsPath
                | Type::As4Path
                | Type::NextHop
                | Type::MultiExitDisc
                | Type::LocalPref
                | Type::As4Aggregator,
            ) => Treatment::TreatAsWithdraw,
            Some(Type::MpReachNlri | Type::MpUnreachNlri) => Treatment::AfiSafiDisable,
            Some(Type::AtomicAggregate | Type::Aggregator) | None => Treatment::AttributeDiscard,
        };
        Self {
            type_,
            subcode,
            treatment,
            data,
            family,
        }
    }

    /// A mandatory well-known attribute is missing
    pub(crate) fn missing(type_: Type) -> Self {
        Self {
            type_: type_ as u8,
            subcode: UpdateMessageErrorSubcode::MissingWellKnownAttribute,
            treatment: Treatment::TreatAsWithdraw,
            data: Bytes::copy_from_slice(&[type_ as u8]),
            family: None,
        }
    }

    /// The attribute list cannot be parsed any further
    fn list() -> Self {
        Self {
            type_: 0,
            subcode: UpdateMessageErrorSubcode::MalformedAttributeList,
            treatment: Treatment::TreatAsWithdraw,
            data: Bytes::new(),
            family: None,
        }
    }
}

/// BGP path attribute
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    pub flags: Flags,
    pub data: Data,
}

impl Component for Value {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let Some((flags, type_, mut body)) = PathAttributes::split_attribute(src) else {
            return Err(Error::update(
                UpdateMessageErrorSubcode::AttributeLengthError,
                Bytes::new(),
            ));
        };
        let raw = body.clone();
        let data = Data::decode(type_, flags, &mut body, &DecodeContext::default())
            .map_err(|subcode| Error::update(subcode, raw))?;
        Ok(Self { flags, data })
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let mut len = 0;
        let flags = self.wire_flags();
        dst.put_u8(flags.0); // Flags
        len += 1;
        dst.put_u8(u8::from(&self.data)); // Type
        len += 1;
        let len_pos = dst.len();
        let two_byte_len = if flags.is_extended_length() {
            dst.put_u16(0); // Placeholder for the length
            len += 2;
            true
        } else {
            dst.put_u8(0); // Placeholder for the length
            len += 1;
            false
        };
        let data_len = match self.data {
            Data::Origin(origin) => origin.to_bytes(dst),
            Data::AsPath(as_path) | Data::As4Path(as_path) => as_path.to_bytes(dst),
            Data::NextHop(next_hop) => next_hop.to_bytes(dst),
            Data::MultiExitDisc(med) => med.to_bytes(dst),
            Data::LocalPref(local_pref) => local_pref.to_bytes(dst),
            Data::AtomicAggregate => 0,
            Data::Aggregator(agg) | Data::As4Aggregator(agg) => agg.to_bytes(dst),
            Data::MpReachNlri(mp_reach_nlri) => mp_reach_nlri.to_bytes(dst),
            Data::MpUnreachNlri(mp_unreach_nlri) => mp_unreach_nlri.to_bytes(dst),
            Data::Unsupported(_, data) => {
                dst.put_slice(&data);
                data.len()
            }
        };
        if two_byte_len {
            dst[len_pos..len_pos + 2].copy_from_slice(
                &(u16::try_from(data_len)
                    .expect("Path attribute length overflow")
                    .to_be_bytes()),
            );
        } else {
            dst[len_pos] = u8::try_from(data_len).expect("Path attribute length overflow");
        }
        len + data_len
    }

    fn encoded_len(&self) -> usize {
        1 + 1
            + if self.wire_flags().is_extended_length() {
                2
            } else {
                1
            }
            + self.data_len()
    }
}

impl Value {
    fn data_len(&self) -> usize {
        match &self.data {
            Data::Origin(origin) => origin.encoded_len(),
            Data::AsPath(as_path) | Data::As4Path(as_path) => as_path.encoded_len(),
            Data::NextHop(next_hop) => next_hop.encoded_len(),
            Data::MultiExitDisc(_) | Data::LocalPref(_) => 4,
            Data::AtomicAggregate => 0,
            Data::Aggregator(agg) | Data::As4Aggregator(agg) => agg.encoded_len(),
            Data::MpReachNlri(mp_reach_nlri) => mp_reach_nlri.encoded_len(),
            Data::MpUnreachNlri(mp_unreach_nlri) => mp_unreach_nlri.encoded_len(),
            Data::Unsupported(_, data) => data.len(),
        }
    }

    /// Flags with the extended length bit set if the value needs it
    fn wire_flags(&self) -> Flags {
        if self.data_len() > usize::from(u8::MAX) {
            Flags(self.flags.0 | Flags::EXTENDED_LENGTH)
        } else {
            self.flags
        }
    }
}

/// BGP path attribute flags
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Flags(pub u8);

impl Flags {
    /// Transitive, well-known, complete
    pub const WELL_KNOWN_COMPLETE: Flags = Flags(0b0100_0000);
    /// Optional, Transitive, Complete
    pub const OPTIONAL_TRANSITIVE: Flags = Flags(0b1100_0000);
    /// Optional, Non-transitive, Complete
    pub const OPTIONAL: Flags = Flags(0b1000_0000);
    /// Optional, Extended Length, Non-transitive, Complete
    pub const OPTIONAL_TRANSITIVE_EXTENDED: Flags = Flags(0b1001_0000);

    const EXTENDED_LENGTH: u8 = 0x10;

    /// Check if the attribute is optional
    pub const fn is_optional(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Check if the attribute is transitive
    pub const fn is_transitive(self) -> bool {
        self.0 & 0x40 != 0
    }

    /// Check if the attribute is partial
    pub const fn is_partial(self) -> bool {
        self.0 & 0x20 != 0
    }

    /// Check if the attribute is extended length
    pub const fn is_extended_length(self) -> bool {
        self.0 & Self::EXTENDED_LENGTH != 0
    }
}

/// BGP path attribute data
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Data {
    Origin(Origin),
    AsPath(AsPath),
    /// BGP next hop (RFC 4271 Section 5.1.3)
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
    MpReachNlri(MpReachNlri),     // RFC 4760
    MpUnreachNlri(MpUnreachNlri), // RFC 4760
    As4Path(AsPath),              // RFC 4893/6793
    As4Aggregator(Aggregator),    // RFC 4893/6793
    Unsupported(u8, Bytes),
}

// It does not make sense to implement Component for Data because its length is given by the Flags

impl Data {
    /// Decode an attribute value of `src.len()` bytes
    fn decode(
        type_: u8,
        flags: Flags,
        src: &mut Bytes,
        ctx: &DecodeContext,
    ) -> Result<Self, UpdateMessageErrorSubcode> {
        use UpdateMessageErrorSubcode as Sub;
        let len = src.remaining();
        let Some(known) = Type::from_u8(type_) else {
            if !flags.is_optional() {
                return Err(Sub::UnrecognizedWellKnownAttribute);
            }
            return Ok(Self::Unsupported(type_, src.split_off(0)));
        };
        if known.is_well_known() == flags.is_optional() {
            return Err(Sub::AttributeFlagsError);
        }
        let fixed_len = |expected: usize| {
            if len == expected {
                Ok(())
            } else {
                Err(Sub::AttributeLengthError)
            }
        };
        let data = match known {
            Type::Origin => {
                fixed_len(1)?;
                Self::Origin(Origin::from_u8(src.get_u8()).ok_or(Sub::InvalidOriginAttribute)?)
            }
            Type::AsPath => Self::AsPath(
                AsPath::decode(src, ctx.four_octet_as).ok_or(Sub::MalformedAsPath)?,
            ),
            Type::NextHop => {
                fixed_len(4)?;
                Self::NextHop(Ipv4Addr::from(src.get_u32()))
            }
            Type::MultiExitDisc => {
                fixed_len(4)?;
                Self::MultiExitDisc(src.get_u32())
            }
            Type::LocalPref => {
                fixed_len(4)?;
                Self::LocalPref(src.get_u32())
            }
            Type::AtomicAggregate => {
                fixed_len(0)?;
                Self::AtomicAggregate
            }
            Type::Aggregator => Self::Aggregator(Aggregator::decode(src, None)?),
            Type::MpReachNlri => Self::MpReachNlri(
                MpReachNlri::decode(src, ctx).map_err(|_| Sub::OptionalAttributeError)?,
            ),
            Type::MpUnreachNlri => Self::MpUnreachNlri(
                MpUnreachNlri::decode(src, ctx).map_err(|_| Sub::OptionalAttributeError)?,
            ),
            Type::As4Path => {
                Self::As4Path(AsPath::decode(src, Some(true)).ok_or(Sub::MalformedAsPath)?)
            }
            Type::As4Aggregator => Self::As4Aggregator(Aggregator::decode(src, Some(true))?),
        };
        src.advance(src.remaining());
        Ok(data)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum Type {
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,
    MpReachNlri = 14,
    MpUnreachNlri = 15,
    As4Path = 17,
    As4Aggregator = 18,
}

impl Type {
    /// Check if this is a well-known attribute, which must not have the optional flag
    #[must_use]
    pub const fn is_well_known(self) -> bool {
        matches!(
            self,
            Self::Origin | Self::AsPath | Self::NextHop | Self::LocalPref | Self::AtomicAggregate
        )
    }
}

impl From<&Data> for u8 {
    fn from(data: &Data) -> u8 {
        match data {
            Data::Origin(_) => Type::Origin as u8,
            Data::AsPath(_) => Type::AsPath as u8,
            Data::NextHop(_) => Type::NextHop as u8,
            Data::MultiExitDisc(_) => Type::MultiExitDisc as u8,
            Data::LocalPref(_) => Type::LocalPref as u8,
            Data::AtomicAggregate => Type::AtomicAggregate as u8,
            Data::Aggregator(_) => Type::Aggregator as u8,
            Data::MpReachNlri(_) => Type::MpReachNlri as u8,
            Data::MpUnreachNlri(_) => Type::MpUnreachNlri as u8,
            Data::As4Path(_) => Type::As4Path as u8,
            Data::As4Aggregator(_) => Type::As4Aggregator as u8,
            Data::Unsupported(type_, _) => *type_,
        }
    }
}

/// BGP origin
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl Component for Origin {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        ensure_remaining!(src, 1, "origin");
        let value = src.get_u8();
        match Self::from_u8(value) {
            Some(origin) => Ok(origin),
            None => Err(Error::InternalType("origin", u16::from(value))),
        }
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        dst.put_u8(self as u8);
        self.encoded_len()
    }

    fn encoded_len(&self) -> usize {
        1
    }
}

/// BGP AS path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AsPath(pub Vec<AsSegment>);

impl Component for AsPath {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let path = Self::decode(src, None).ok_or(Error::InternalLength(
            "AS path",
            std::cmp::Ordering::Equal,
        ))?;
        src.advance(src.remaining());
        Ok(path)
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let mut len = 0;
        for segment in self.0 {
            len += segment.to_bytes(dst);
        }
        len
    }

    fn encoded_len(&self) -> usize {
        self.0.iter().map(AsSegment::encoded_len).sum()
    }
}

impl Deref for AsPath {
    type Target = Vec<AsSegment>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsPath {
    /// Decode the whole buffer as an AS path without consuming it
    ///
    /// RFC 6793 Section 4 makes the AS number 2 or 4 bytes depending on the
    /// session. If `as4` is not given, 4 bytes is tried before 2 bytes and
    /// the first one that consumes the buffer exactly wins.
    fn decode(src: &Bytes, as4: Option<bool>) -> Option<Self> {
        let widths: &[bool] = match as4 {
            Some(true) => &[true],
            Some(false) => &[false],
            None => &[true, false],
        };
        widths
            .iter()
            .find_map(|&as4| Self::decode_with(src.clone(), as4))
    }

    fn decode_with(mut src: Bytes, as4: bool) -> Option<Self> {
        let width = if as4 { 4 } else { 2 };
        let mut segments = Vec::new();
        while src.has_remaining() {
            if src.remaining() < 2 {
                return None;
            }
            let type_ = AsSegmentType::from_u8(src.get_u8())?;
            let len = usize::from(src.get_u8());
            if len == 0 || src.remaining() < len * width {
                return None;
            }
            let asns = (0..len)
                .map(|_| {
                    if as4 {
                        src.get_u32()
                    } else {
                        u32::from(src.get_u16())
                    }
                })
                .collect();
            segments.push(AsSegment { type_, asns, as4 });
        }
        Some(Self(segments))
    }

    /// Number of times `asn` appears in the path
    #[must_use]
    pub fn count(&self, asn: u32) -> usize {
        self.0
            .iter()
            .flat_map(|segment| segment.asns.iter())
            .filter(|&&a| a == asn)
            .count()
    }

    /// Path length for route selection: an AS_SET counts as one, and
    /// confederation segments do not count (RFC 5065 Section 5.3)
    #[must_use]
    pub fn path_len(&self) -> usize {
        self.0
            .iter()
            .map(|segment| match segment.type_ {
                AsSegmentType::AsSequence => segment.asns.len(),
                AsSegmentType::AsSet => 1,
                AsSegmentType::ConfedSequence | AsSegmentType::ConfedSet => 0,
            })
            .sum()
    }

    fn set_as4(&mut self, as4: bool) {
        for segment in &mut self.0 {
            segment.as4 = as4;
        }
    }

    fn has_as4_asn(&self) -> bool {
        self.0
            .iter()
            .flat_map(|segment| segment.asns.iter())
            .any(|&asn| asn > u32::from(u16::MAX))
    }

    /// Replace four-octet AS numbers with `AS_TRANS`
    fn to_two_octet(&mut self) {
        for segment in &mut self.0 {
            for asn in &mut segment.asns {
                if *asn > u32::from(u16::MAX) {
                    *asn = u32::from(AS_TRANS);
                }
            }
            segment.as4 = false;
        }
    }

    /// The AS4_PATH for this path, which leaves out confederation segments
    fn as4_path(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|segment| {
                    matches!(
                        segment.type_,
                        AsSegmentType::AsSequence | AsSegmentType::AsSet
                    )
                })
                .map(|segment| AsSegment {
                    as4: true,
                    ..segment.clone()
                })
                .collect(),
        )
    }

    /// Keep the leading part of this path that AS4_PATH does not cover
    /// and append AS4_PATH
    fn merge_as4(&mut self, as4_path: Self) {
        let ours = self.path_len();
        let theirs = as4_path.path_len();
        if theirs > ours {
            // RFC 6793 Section 4.2.3: ignore the AS4_PATH
            self.set_as4(true);
            return;
        }
        let mut keep = ours - theirs;
        let mut merged = Vec::new();
        for segment in self.0.drain(..) {
            match segment.type_ {
                AsSegmentType::ConfedSequence | AsSegmentType::ConfedSet => merged.push(segment),
                AsSegmentType::AsSet if keep > 0 => {
                    keep -= 1;
                    merged.push(segment);
                }
                AsSegmentType::AsSequence if keep > 0 => {
                    let take = keep.min(segment.asns.len());
                    keep -= take;
                    merged.push(AsSegment {
                        asns: segment.asns[..take].to_vec(),
                        ..segment
                    });
                }
                AsSegmentType::AsSet | AsSegmentType::AsSequence => {}
            }
        }
        merged.extend(as4_path.0);
        self.0 = merged;
        self.set_as4(true);
    }
}

/// BGP AS path segment (RFC 4271 Section 5.1.2, RFC 6793 Section 4)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsSegment {
    pub type_: AsSegmentType,
    pub asns: Vec<u32>,
    /// Extra member to indicate that this structure was created from a 4-byte AS path
    /// or that it should be encoded as a 4-byte AS path
    pub as4: bool,
}

/// BGP AS path segment type
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum AsSegmentType {
    AsSet = 1,
    AsSequence = 2,
    ConfedSequence = 3,
    ConfedSet = 4,
}

impl Component for AsSegment {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut path = AsPath::from_bytes(src)?;
        match (path.0.pop(), path.0.is_empty()) {
            (Some(segment), true) => Ok(segment),
            _ => Err(Error::InternalLength(
                "AS segment",
                std::cmp::Ordering::Equal,
            )),
        }
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let encoded_len = self.encoded_len();
        dst.put_u8(self.type_ as u8);
        let asns_len = self.asns.len();
        dst.put_u8(u8::try_from(asns_len).expect("AS segment length overflow"));
        for asn in self.asns {
            if self.as4 {
                dst.put_u32(asn);
            } else {
                dst.put_u16(u16::try_from(asn).unwrap_or(AS_TRANS));
            }
        }
        encoded_len
    }

    fn encoded_len(&self) -> usize {
        2 + self.asns.len() * if self.as4 { 4 } else { 2 }
    }
}

/// BGP aggregator (RFC 4271 Section 5.1.7, RFC 6793 Section 3)
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Aggregator {
    pub asn: u32,
    pub ip: Ipv4Addr,
    /// Whether the AS number is encoded in 4 bytes
    pub as4: bool,
}

impl Aggregator {
    fn decode(src: &mut Bytes, as4: Option<bool>) -> Result<Self, UpdateMessageErrorSubcode> {
        let as4 = match (src.remaining(), as4) {
            (8, None | Some(true)) => true,
            (6, None | Some(false)) => false,
            _ => return Err(UpdateMessageErrorSubcode::AttributeLengthError),
        };
        let asn = if as4 {
            src.get_u32()
        } else {
            u32::from(src.get_u16())
        };
        let ip = Ipv4Addr::from(src.get_u32());
        Ok(Self { asn, ip, as4 })
    }
}

impl Component for Aggregator {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        Self::decode(src, None).map_err(|subcode| Error::update(subcode, Bytes::new()))
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        if self.as4 {
            dst.put_u32(self.asn);
        } else {
            dst.put_u16(u16::try_from(self.asn).unwrap_or(AS_TRANS));
        }
        self.ip.to_bytes(dst);
        self.encoded_len()
    }

    fn encoded_len(&self) -> usize {
        4 + if self.as4 { 4 } else { 2 }
    }
}

/// BGP MP_REACH_NLRI (RFC 4760 Section 7)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MpReachNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub next_hop: MpNextHop,
    pub nlri: Routes,
}

impl Component for MpReachNlri {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        Self::decode(src, &DecodeContext::default())
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let mut len = 0;
        dst.put_u16(self.afi as u16);
        len += 2;
        dst.put_u8(u8::try_from(self.safi as u16).expect("MP_REACH_NLRI SAFI out of range"));
        len += 1;
        dst.put_u8(
            u8::try_from(self.next_hop.encoded_len())
                .expect("MP_REACH_NLRI next hop length overflow"),
        );
        len += 1;
        len += self.next_hop.to_bytes(dst);
        dst.put_u8(0); // Reserved
        len += 1;
        len += self.nlri.to_bytes(dst);
        len
    }

    fn encoded_len(&self) -> usize {
        2 + 1 + 1 + self.next_hop.encoded_len() + 1 + self.nlri.encoded_len()
    }
}

impl MpReachNlri {
    /// Decode with path identifiers if the family has ADD-PATH receive
    pub fn decode(src: &mut Bytes, ctx: &DecodeContext) -> Result<Self, Error> {
        ensure_remaining!(src, 5, "MP_REACH_NLRI");
        let afi = src.get_u16();
        let afi = Afi::from_u16(afi).ok_or(Error::InternalType("MP_REACH_NLRI AFI", afi))?;
        let safi = u16::from(src.get_u8());
        let safi = Safi::from_u16(safi).ok_or(Error::InternalType("MP_REACH_NLRI SAFI", safi))?;
        let nh_len = usize::from(src.get_u8());
        // Next hop and the reserved octet
        ensure_remaining!(src, nh_len + 1, "MP_NEXT_HOP");
        let mut nh_src = src.split_to(nh_len);
        let next_hop = MpNextHop::from_bytes(&mut nh_src)?;
        let _ = src.get_u8(); // Reserved
        let nlri = Routes::decode(src, ctx.has_path_id(Family::new(afi, safi)))?;
        Ok(Self {
            afi,
            safi,
            next_hop,
            nlri,
        })
    }

    #[must_use]
    pub const fn family(&self) -> Family {
        Family::new(self.afi, self.safi)
    }
}

/// Next hop for MP_REACH_NLRI
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MpNextHop {
    Single(IpAddr),
    V6AndLL(Ipv6Addr, Ipv6Addr),
}

impl Component for MpNextHop {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        match src.remaining() {
            4 | 16 => Ok(MpNextHop::Single(IpAddr::from_bytes(src)?)),
            32 => {
                let v6local = Ipv6Addr::from_bytes(src)?;
                let v6ll = Ipv6Addr::from_bytes(src)?;
                Ok(MpNextHop::V6AndLL(v6local, v6ll))
            }
            _ => Err(Error::InternalLength(
                "MP_NEXT_HOP",
                std::cmp::Ordering::Equal,
            )),
        }
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        match self {
            MpNextHop::Single(ip) => {
                ip.to_bytes(dst);
            }
            MpNextHop::V6AndLL(v6local, v6ll) => {
                v6local.to_bytes(dst);
                v6ll.to_bytes(dst);
            }
        };
        self.encoded_len()
    }

    fn encoded_len(&self) -> usize {
        match self {
            MpNextHop::Single(IpAddr::V4(_)) => 4,
            MpNextHop::Single(IpAddr::V6(_)) => 16,
            MpNextHop::V6AndLL(_, _) => 32,
        }
    }
}

impl From<IpAddr> for MpNextHop {
    fn from(ip: IpAddr) -> Self {
        MpNextHop::Single(ip)
    }
}

impl MpNextHop {
    /// The global address of the next hop
    #[must_use]
    pub const fn addr(&self) -> IpAddr {
        match self {
            Self::Single(ip) => *ip,
            Self::V6AndLL(v6, _) => IpAddr::V6(*v6),
        }
    }
}

/// BGP MP_UNREACH_NLRI (RFC 4760 Section 7)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MpUnreachNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub withdrawn_routes: Routes,
}

impl Component for MpUnreachNlri {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        Self::decode(src, &DecodeContext::default())
    }

    fn to_bytes(self, dst: &mut BytesMut) -> usize {
        let mut len = 0;
        dst.put_u16(self.afi as u16);
        len += 2;
        dst.put_u8(u8::try_from(self.safi as u16).expect("MP_UNREACH_NLRI SAFI out of range"));
        len += 1;
        len += self.withdrawn_routes.to_bytes(dst);
        len
    }

    fn encoded_len(&self) -> usize {
        3 + self.withdrawn_routes.encoded_len()
    }
}

impl MpUnreachNlri {
    /// Decode with path identifiers if the family has ADD-PATH receive
    pub fn decode(src: &mut Bytes, ctx: &DecodeContext) -> Result<Self, Error> {
        ensure_remaining!(src, 3, "MP_UNREACH_NLRI");
        let afi = src.get_u16();
        let afi = Afi::from_u16(afi).ok_or(Error::InternalType("MP_UNREACH_NLRI AFI", afi))?;
        let safi = u16::from(src.get_u8());
        let safi =
            Safi::from_u16(safi).ok_or(Error::InternalType("MP_UNREACH_NLRI SAFI", safi))?;
        let withdrawn_routes = Routes::decode(src, ctx.has_path_id(Family::new(afi, safi)))?;
        Ok(Self {
            afi,
            safi,
            withdrawn_routes,
        })
    }

    #[must_use]
    pub const fn family(&self) -> Family {
        Family::new(self.afi, self.safi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::tests::hex_to_bytes;

    #[test]
    fn test_origin() {
        let mut src = hex_to_bytes("40 01 01 00");
        let pa = Value::from_bytes(&mut src).unwrap();
        assert_eq!(
            pa,
            Value {
                flags: Flags(0x40),
                data: Data::Origin(Origin::Igp),
            }
        );
    }

    #[test]
    fn test_as2_aspath() {
        let mut src = hex_to_bytes("40 0204 0201 fd7d");
        let pa = Value::from_bytes(&mut src).unwrap();
        assert_eq!(
            pa,
            Value {
                flags: Flags(0x40),
                data: Data::AsPath(AsPath(vec![AsSegment {
                    type_: AsSegmentType::AsSequence,
                    asns: vec![0xfd7d],
                    as4: false
                }])),
            }
        );
    }

    #[test]
    fn test_as4_aspath() {
        let mut src = hex_to_bytes("40 02 0e 0203 fcde39d1 fcde3880 fcde3122");
        let pa = Value::from_bytes(&mut src).unwrap();
        assert_eq!(
            pa,
            Value {
                flags: Flags(0x40),
                data: Data::AsPath(AsPath(vec![AsSegment {
                    type_: AsSegmentType::AsSequence,
                    asns: vec![0xfcde39d1, 0xfcde3880, 0xfcde3122],
                    as4: true
                }])),
            }
        );
    }

    #[test]
    fn test_aspath_width_from_session() {
        // Two 2-byte segments that also parse as one 4-byte segment
        let src = hex_to_bytes("0202 0001 0002 0201 0003");
        let guessed = AsPath::decode(&src, None).unwrap();
        assert_eq!(guessed.len(), 1);
        assert_eq!(guessed[0].asns, vec![0x0001_0002, 0x0201_0003]);
        let known = AsPath::decode(&src, Some(false)).unwrap();
        assert_eq!(known.len(), 2);
        assert_eq!(known.path_len(), 3);
        // Zero-length segments are malformed
        assert!(AsPath::decode(&hex_to_bytes("0200"), None).is_none());
    }

    #[test]
    fn test_next_hop() {
        let mut src = hex_to_bytes("40 03 04 7f000001");
        let pa = Value::from_bytes(&mut src).unwrap();
        assert_eq!(
            pa,
            Value {
                flags: Flags(0x40),
                data: Data::NextHop(Ipv4Addr::new(127, 0, 0, 1)),
            }
        );
    }

    #[test]
    fn test_as4path() {
        let mut src = hex_to_bytes("c0 11 06 0201 0000fd7d");
        let pa = Value::from_bytes(&mut src).unwrap();
        assert_eq!(
            pa,
            Value {
                flags: Flags(0xc0),
                data: Data::As4Path(AsPath(vec![AsSegment {
                    type_: AsSegmentType::AsSequence,
                    asns: vec![0xfd7d],
                    as4: true
                }])),
            }
        );
    }

    #[test]
    fn test_attribute_errors_classified() {
        let mut src = hex_to_bytes(
            "
            40 01 01 07
            40 06 01 00
            40 02 04 0201 fd7d
            40 02 04 0201 fd7e
            80 0e 05 0002 01 10 00
            c0 20 00",
        );
        let (attrs, errors) = PathAttributes::decode(&mut src, &DecodeContext::default());
        // The duplicate AS_PATH is dropped silently
        assert_eq!(attrs.len(), 2);
        assert!(attrs.as_path().is_some());
        let summary: Vec<_> = errors
            .iter()
            .map(|e| (e.type_, e.subcode, e.treatment, e.family))
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    1,
                    UpdateMessageErrorSubcode::InvalidOriginAttribute,
                    Treatment::TreatAsWithdraw,
                    None
                ),
                (
                    6,
                    UpdateMessageErrorSubcode::AttributeLengthError,
                    Treatment::AttributeDiscard,
                    None
                ),
                (
                    14,
                    UpdateMessageErrorSubcode::OptionalAttributeError,
                    Treatment::AfiSafiDisable,
                    Some(Family::IPV6_UNICAST)
                ),
            ]
        );
    }

    #[test]
    fn test_attribute_overrun() {
        let mut src = hex_to_bytes("40 01 01 00 40 02 09 0201 fd7d");
        let (attrs, errors) = PathAttributes::decode(&mut src, &DecodeContext::default());
        assert_eq!(attrs.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].treatment, Treatment::TreatAsWithdraw);
        assert_eq!(
            errors[0].subcode,
            UpdateMessageErrorSubcode::MalformedAttributeList
        );
    }

    #[test]
    fn test_flags_checked() {
        // ORIGIN marked optional
        let mut src = hex_to_bytes("c0 01 01 00");
        assert!(Value::from_bytes(&mut src).is_err());
        // Unknown well-known attribute
        let mut src = hex_to_bytes("40 63 00");
        assert!(Value::from_bytes(&mut src).is_err());
        let mut src = hex_to_bytes("c0 63 00");
        assert_eq!(
            Value::from_bytes(&mut src).unwrap().data,
            Data::Unsupported(0x63, Bytes::new())
        );
    }

    fn as_sequence(asns: &[u32], as4: bool) -> AsSegment {
        AsSegment {
            type_: AsSegmentType::AsSequence,
            asns: asns.to_vec(),
            as4,
        }
    }

    #[test]
    fn test_as4_to_as2() {
        let mut attrs = PathAttributes(vec![
            Value {
                flags: Flags::WELL_KNOWN_COMPLETE,
                data: Data::AsPath(AsPath(vec![
                    AsSegment {
                        type_: AsSegmentType::ConfedSequence,
                        asns: vec![65010],
                        as4: true,
                    },
                    as_sequence(&[4_200_000_000, 65001], true),
                ])),
            },
            Value {
                flags: Flags::OPTIONAL_TRANSITIVE,
                data: Data::Aggregator(Aggregator {
                    asn: 4_200_000_000,
                    ip: Ipv4Addr::new(192, 0, 2, 1),
                    as4: true,
                }),
            },
        ]);
        attrs.set_four_octet_as(false);
        assert_eq!(attrs.len(), 4);
        assert_eq!(
            attrs.as_path().unwrap()[1],
            as_sequence(&[u32::from(AS_TRANS), 65001], false)
        );
        assert_eq!(
            attrs.get(Type::As4Path).unwrap().data,
            Data::As4Path(AsPath(vec![as_sequence(&[4_200_000_000, 65001], true)]))
        );
        let Data::Aggregator(agg) = attrs.get(Type::Aggregator).unwrap().data else {
            panic!("no aggregator");
        };
        assert_eq!(agg.asn, u32::from(AS_TRANS));
        assert!(!agg.as4);
        let Data::As4Aggregator(agg4) = attrs.get(Type::As4Aggregator).unwrap().data else {
            panic!("no AS4_AGGREGATOR");
        };
        assert_eq!(agg4.asn, 4_200_000_000);
        // Wire length: AS_PATH 2+2 + 2+4, AGGREGATOR 6, AS4_PATH 2+8, AS4_AGGREGATOR 8
        assert_eq!(attrs.encoded_len(), 3 + 10 + 3 + 6 + 3 + 10 + 3 + 8);

        attrs.merge_as4();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.as_path().unwrap().count(4_200_000_000), 1);
        assert_eq!(attrs.as_path().unwrap().path_len(), 2);
    }

    #[test]
    fn test_two_octet_path_untouched() {
        let mut attrs = PathAttributes(vec![Value {
            flags: Flags::WELL_KNOWN_COMPLETE,
            data: Data::AsPath(AsPath(vec![as_sequence(&[65001, 65002], true)])),
        }]);
        attrs.set_four_octet_as(false);
        assert_eq!(attrs.len(), 1);
        assert_eq!(
            attrs.as_path().unwrap()[0],
            as_sequence(&[65001, 65002], false)
        );
        attrs.set_four_octet_as(true);
        assert!(attrs.as_path().unwrap()[0].as4);
    }
}
