//! Flat key/value encodings of the blob index rows.
//!
//! A key is the row type's name followed by its `|`-separated parts; a value
//! is the `|`-separated value parts alone. Every part is encoded according to
//! its [`PartType`], so that keys sort usefully and never contain a stray
//! `|`.

use std::borrow::Cow;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::IndexError;
use crate::blob::BlobRef;

/// Bytes left alone by query escaping; space becomes `+` separately.
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const TIME_EXAMPLE: &str = "2011-01-23T05:23:12";
const REVERSE_TIME_PREFIX: &str = "rt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    /// Signer key id, written verbatim.
    KeyId,
    /// RFC 3339 time, written verbatim.
    Time,
    /// RFC 3339 time with every digit `d` replaced by `9-d`, so that later
    /// times sort first.
    ReverseTime,
    /// Canonical blob ref; invalid or absent refs render empty.
    BlobRef,
    /// Query-escaped string.
    Str,
    /// Decimal integer.
    IntStr,
    /// Unescaped string; see [`contains_unsafe_raw_str_byte`].
    RawStr,
}

#[derive(Debug, Clone, Copy)]
pub struct Part {
    pub name: &'static str,
    pub typ: PartType,
}

const fn part(name: &'static str, typ: PartType) -> Part {
    Part { name, typ }
}

/// One argument of [`KeyType::key`], [`KeyType::prefix`] or
/// [`KeyType::val`].
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Str(&'a str),
    Int(i64),
    Uint(u64),
    Ref(Option<&'a BlobRef>),
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(s: &'a str) -> Self {
        Arg::Str(s)
    }
}

impl<'a> From<&'a String> for Arg<'a> {
    fn from(s: &'a String) -> Self {
        Arg::Str(s)
    }
}

impl From<i64> for Arg<'_> {
    fn from(n: i64) -> Self {
        Arg::Int(n)
    }
}

impl From<i32> for Arg<'_> {
    fn from(n: i32) -> Self {
        Arg::Int(n.into())
    }
}

impl From<u64> for Arg<'_> {
    fn from(n: u64) -> Self {
        Arg::Uint(n)
    }
}

impl<'a> From<&'a BlobRef> for Arg<'a> {
    fn from(br: &'a BlobRef) -> Self {
        Arg::Ref(Some(br))
    }
}

impl<'a> From<Option<&'a BlobRef>> for Arg<'a> {
    fn from(br: Option<&'a BlobRef>) -> Self {
        Arg::Ref(br)
    }
}

/// The layout of one kind of index row.
#[derive(Debug)]
pub struct KeyType {
    pub name: &'static str,
    pub key_parts: &'static [Part],
    pub val_parts: &'static [Part],
}

impl KeyType {
    /// A range-scan lower bound for every key whose leading parts are
    /// `args`. Ends with `|`.
    pub fn prefix(&self, args: &[Arg]) -> String {
        self.build(true, true, self.key_parts, args)
    }

    /// Panics unless `args` has exactly one entry per key part.
    pub fn key(&self, args: &[Arg]) -> String {
        self.build(false, true, self.key_parts, args)
    }

    /// Panics unless `args` has exactly one entry per value part.
    pub fn val(&self, args: &[Arg]) -> String {
        self.build(false, false, self.val_parts, args)
    }

    fn build(&self, is_prefix: bool, is_key: bool, parts: &[Part], args: &[Arg]) -> String {
        if !is_prefix && args.len() != parts.len() {
            panic!("wrong number of arguments");
        }
        if args.len() > parts.len() {
            panic!("too many arguments");
        }

        let mut buf = String::new();
        if is_key {
            buf.push_str(self.name);
        }
        for (i, (part, arg)) in parts.iter().zip(args).enumerate() {
            if is_key || i > 0 {
                buf.push('|');
            }
            encode_part(&mut buf, part, arg);
        }
        if is_prefix {
            buf.push('|');
        }
        buf
    }

    /// Splits a key built by [`KeyType::key`] back into its decoded parts.
    pub fn parse_key(&self, key: &str) -> Result<Vec<String>> {
        let rest = key
            .strip_prefix(self.name)
            .and_then(|r| r.strip_prefix('|'));
        match rest {
            Some(rest) => self.parse(rest, self.key_parts).map_err(|_| {
                anyhow!(IndexError::BogusKey {
                    typ: self.name,
                    key: key.to_owned(),
                })
            }),
            None => bail!(IndexError::BogusKey {
                typ: self.name,
                key: key.to_owned(),
            }),
        }
    }

    /// Splits a value built by [`KeyType::val`] back into its decoded parts.
    pub fn parse_val(&self, val: &str) -> Result<Vec<String>> {
        self.parse(val, self.val_parts).map_err(|_| {
            anyhow!(IndexError::BogusValue {
                typ: self.name,
                val: val.to_owned(),
            })
        })
    }

    fn parse(&self, s: &str, parts: &[Part]) -> Result<Vec<String>> {
        if parts.is_empty() {
            if s.is_empty() {
                return Ok(vec![]);
            }
            bail!("unexpected trailing data");
        }
        // the last part keeps any remaining pipes, for raw strings
        let fields: Vec<&str> = s.splitn(parts.len(), '|').collect();
        if fields.len() != parts.len() {
            bail!("want {} parts, got {}", parts.len(), fields.len());
        }
        parts
            .iter()
            .zip(fields)
            .map(|(part, field)| decode_part(part, field))
            .collect()
    }
}

fn encode_part(buf: &mut String, part: &Part, arg: &Arg) {
    match part.typ {
        PartType::IntStr => match arg {
            Arg::Int(n) => buf.push_str(&n.to_string()),
            Arg::Uint(n) => buf.push_str(&n.to_string()),
            _ => panic!("bogus int type for part {:?}", part.name),
        },
        PartType::Str => buf.push_str(&urle(arg_str(part, arg))),
        PartType::RawStr => buf.push_str(arg_str(part, arg)),
        PartType::Time => {
            let s = arg_str(part, arg);
            check_time(s);
            buf.push_str(s);
        }
        PartType::ReverseTime => {
            let s = arg_str(part, arg);
            check_time(s);
            buf.push_str(&reverse_time_string(s));
        }
        PartType::BlobRef => match arg {
            Arg::Ref(Some(br)) => buf.push_str(&br.to_string()),
            Arg::Ref(None) => {}
            _ => buf.push_str(arg_str(part, arg)),
        },
        PartType::KeyId => buf.push_str(arg_str(part, arg)),
    }
}

fn arg_str<'a>(part: &Part, arg: &Arg<'a>) -> &'a str {
    match arg {
        Arg::Str(s) => *s,
        other => panic!("part {:?} wants a string, got {other:?}", part.name),
    }
}

fn check_time(s: &str) {
    let b = s.as_bytes();
    if b.len() < TIME_EXAMPLE.len() || (b[4] != b'-' && b[10] != b'T') {
        panic!("doesn't look like a time: {s}");
    }
}

fn decode_part(part: &Part, field: &str) -> Result<String> {
    Ok(match part.typ {
        PartType::Str => urld(field)?,
        PartType::ReverseTime => unreverse_time_string(field)?,
        PartType::IntStr => {
            if field.parse::<i64>().is_err() && field.parse::<u64>().is_err() {
                bail!("bogus integer {field:?}");
            }
            field.to_owned()
        }
        _ => field.to_owned(),
    })
}

/// Returns the identifier of `k` before the first `:` or `|`, or "" if it
/// has neither.
pub fn type_of_key(k: &str) -> &str {
    match k.find(|c: char| c == ':' || c == '|') {
        Some(i) => &k[..i],
        None => "",
    }
}

/// Query-escapes `s`: everything but ASCII alphanumerics and `-_.~` is
/// percent-encoded, and spaces become `+`.
pub fn urle(s: &str) -> String {
    s.split(' ')
        .map(|piece| utf8_percent_encode(piece, QUERY_ESCAPE).to_string())
        .collect::<Vec<_>>()
        .join("+")
}

pub fn urld(s: &str) -> Result<String> {
    let plus_decoded: Cow<str> = if s.contains('+') {
        Cow::Owned(s.replace('+', " "))
    } else {
        Cow::Borrowed(s)
    };
    match percent_decode_str(&plus_decoded).decode_utf8() {
        Ok(d) => Ok(d.into_owned()),
        Err(e) => bail!(IndexError::BogusEscape(format!("{s:?}: {e}"))),
    }
}

/// Reports whether `s` holds anything a raw string part must not: a pipe,
/// non-ASCII or control characters, or `%`/`+` that would read as escapes.
pub fn contains_unsafe_raw_str_byte(s: &str) -> bool {
    s.chars()
        .any(|c| c >= 'z' || c < ' ' || c == '%' || c == '+')
}

pub fn reverse_time_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + REVERSE_TIME_PREFIX.len());
    out.push_str(REVERSE_TIME_PREFIX);
    out.extend(s.chars().map(flip_digit));
    out
}

pub fn unreverse_time_string(s: &str) -> Result<String> {
    match s.strip_prefix(REVERSE_TIME_PREFIX) {
        Some(rest) => Ok(rest.chars().map(flip_digit).collect()),
        None => bail!(IndexError::BogusReverseTime(s.to_owned())),
    }
}

fn flip_digit(c: char) -> char {
    match c.to_digit(10) {
        Some(d) => char::from(b'9' - d as u8),
        None => c,
    }
}

/// Formats `t` the way time parts are stored: RFC 3339 in UTC, with
/// fractional seconds only when present.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Version of the index key layout. Bumped whenever a key type is added,
/// changed or removed.
pub const REQUIRED_SCHEMA_VERSION: i64 = 5;

pub static KEY_SCHEMA_VERSION: KeyType = KeyType {
    name: "schemaversion",
    key_parts: &[],
    val_parts: &[part("version", PartType::IntStr)],
};

pub static KEY_MISSING: KeyType = KeyType {
    name: "missing",
    key_parts: &[part("have", PartType::BlobRef), part("needed", PartType::BlobRef)],
    val_parts: &[part("1", PartType::Str)],
};

/// A claim modifying a permanode, keyed by permanode, signer and date.
pub static KEY_PERMANODE_CLAIM: KeyType = KeyType {
    name: "claim",
    key_parts: &[
        part("permanode", PartType::BlobRef),
        part("signer", PartType::KeyId),
        part("claimDate", PartType::Time),
        part("claim", PartType::BlobRef),
    ],
    val_parts: &[
        part("claimType", PartType::Str),
        part("attr", PartType::Str),
        part("value", PartType::Str),
        part("signerRef", PartType::BlobRef),
    ],
};

pub static KEY_RECENT_PERMANODE: KeyType = KeyType {
    name: "recpn",
    key_parts: &[
        part("owner", PartType::KeyId),
        part("modtime", PartType::ReverseTime),
        part("claim", PartType::BlobRef),
    ],
    val_parts: &[],
};

pub static KEY_PATH_BACKWARD: KeyType = KeyType {
    name: "signertargetpath",
    key_parts: &[
        part("signer", PartType::KeyId),
        part("target", PartType::BlobRef),
        part("claim", PartType::BlobRef),
    ],
    val_parts: &[
        part("claimDate", PartType::Time),
        part("base", PartType::BlobRef),
        part("active", PartType::Str),
        part("suffix", PartType::Str),
    ],
};

pub static KEY_PATH_FORWARD: KeyType = KeyType {
    name: "path",
    key_parts: &[
        part("signer", PartType::KeyId),
        part("base", PartType::BlobRef),
        part("suffix", PartType::Str),
        part("claimDate", PartType::ReverseTime),
        part("claim", PartType::BlobRef),
    ],
    val_parts: &[part("active", PartType::Str), part("target", PartType::BlobRef)],
};

pub static KEY_WHOLE_TO_FILE_REF: KeyType = KeyType {
    name: "wholetofile",
    key_parts: &[part("whole", PartType::BlobRef), part("schema", PartType::BlobRef)],
    val_parts: &[part("1", PartType::Str)],
};

pub static KEY_FILE_INFO: KeyType = KeyType {
    name: "fileinfo",
    key_parts: &[part("file", PartType::BlobRef)],
    val_parts: &[
        part("size", PartType::IntStr),
        part("filename", PartType::Str),
        part("mimetype", PartType::Str),
        part("whole", PartType::BlobRef),
    ],
};

/// Value holds zero to two comma-separated RFC 3339 times, oldest first.
pub static KEY_FILE_TIMES: KeyType = KeyType {
    name: "filetimes",
    key_parts: &[part("file", PartType::BlobRef)],
    val_parts: &[part("time3339s", PartType::Str)],
};

pub static KEY_SIGNER_ATTR_VALUE: KeyType = KeyType {
    name: "signerattrvalue",
    key_parts: &[
        part("signer", PartType::KeyId),
        part("attr", PartType::Str),
        part("value", PartType::Str),
        part("claimdate", PartType::ReverseTime),
        part("claimref", PartType::BlobRef),
    ],
    val_parts: &[part("permanode", PartType::BlobRef)],
};

/// A claim deleting a permanode or another claim.
pub static KEY_DELETED: KeyType = KeyType {
    name: "deleted",
    key_parts: &[
        part("deleted", PartType::BlobRef),
        part("claimdate", PartType::ReverseTime),
        part("deleter", PartType::BlobRef),
    ],
    val_parts: &[],
};

/// Child to parent edges, for finding what refers to a blob.
pub static KEY_EDGE_BACKWARD: KeyType = KeyType {
    name: "edgeback",
    key_parts: &[
        part("child", PartType::BlobRef),
        part("parent", PartType::BlobRef),
        part("blobref", PartType::BlobRef),
    ],
    val_parts: &[part("parenttype", PartType::Str), part("name", PartType::Str)],
};

/// Width and height after EXIF rotation.
pub static KEY_IMAGE_SIZE: KeyType = KeyType {
    name: "imagesize",
    key_parts: &[part("fileref", PartType::BlobRef)],
    val_parts: &[part("width", PartType::Str), part("height", PartType::Str)],
};

pub static KEY_STATIC_DIR_CHILD: KeyType = KeyType {
    name: "dirchild",
    key_parts: &[part("dirref", PartType::BlobRef), part("child", PartType::Str)],
    val_parts: &[part("1", PartType::Str)],
};

pub static KEY_MEDIA_TAG: KeyType = KeyType {
    name: "mediatag",
    key_parts: &[part("wholeRef", PartType::BlobRef), part("tag", PartType::Str)],
    val_parts: &[part("value", PartType::Str)],
};

/// `vals` is pipe-separated, so it must stay the last value part.
pub static KEY_EXIF_TAG: KeyType = KeyType {
    name: "exiftag",
    key_parts: &[part("wholeRef", PartType::BlobRef), part("tag", PartType::Str)],
    val_parts: &[
        part("type", PartType::Str),
        part("n", PartType::IntStr),
        part("vals", PartType::RawStr),
    ],
};

pub static KEY_EXIF_GPS: KeyType = KeyType {
    name: "exifgps",
    key_parts: &[part("wholeRef", PartType::BlobRef)],
    val_parts: &[part("lat", PartType::Str), part("long", PartType::Str)],
};

pub static ALL_KEY_TYPES: [&KeyType; 17] = [
    &KEY_SCHEMA_VERSION,
    &KEY_MISSING,
    &KEY_PERMANODE_CLAIM,
    &KEY_RECENT_PERMANODE,
    &KEY_PATH_BACKWARD,
    &KEY_PATH_FORWARD,
    &KEY_WHOLE_TO_FILE_REF,
    &KEY_FILE_INFO,
    &KEY_FILE_TIMES,
    &KEY_SIGNER_ATTR_VALUE,
    &KEY_DELETED,
    &KEY_EDGE_BACKWARD,
    &KEY_IMAGE_SIZE,
    &KEY_STATIC_DIR_CHILD,
    &KEY_MEDIA_TAG,
    &KEY_EXIF_TAG,
    &KEY_EXIF_GPS,
];

/// Finds the key type a stored key belongs to.
pub fn key_type_of(k: &str) -> Option<&'static KeyType> {
    let name = match type_of_key(k) {
        "" => k,
        name => name,
    };
    ALL_KEY_TYPES.iter().copied().find(|kt| kt.name == name)
}
