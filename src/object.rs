//! The Git object model and its canonical serialization.
//!
//! Git has four object types: blob, tree, commit, and tag. Each has a
//! canonical byte form `"{type} {size}\0{body}"` and is content-addressed
//! by the SHA-1 hash of that form.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// A 20-byte SHA-1 object ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// The all-zero ID, used to designate a nonexistent object.
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 20 {
            let mut arr = [0u8; 20];
            arr.copy_from_slice(bytes);
            Some(ObjectId(arr))
        } else {
            None
        }
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 {
            return None;
        }
        let bytes = hex::decode(hex).ok()?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Compute the ID of an object given its type and header-less body.
    pub fn hash_body(kind: ObjectType, body: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", kind, body.len()).as_bytes());
        hasher.update(body);
        let digest = hasher.finalize();
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest);
        ObjectId(id)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The four git object types.
///
/// The numeric codes are the packfile type codes; the two delta codes
/// (6 and 7) never leave the packfile layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::Tree => "tree",
            ObjectType::Blob => "blob",
            ObjectType::Tag => "tag",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(ObjectType::Commit),
            "tree" => Some(ObjectType::Tree),
            "blob" => Some(ObjectType::Blob),
            "tag" => Some(ObjectType::Tag),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ObjectType::Commit),
            2 => Some(ObjectType::Tree),
            3 => Some(ObjectType::Blob),
            4 => Some(ObjectType::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Characters trimmed from the ends of a signature name.
const NAME_CRUD: &[char] = &[' ', '.', ',', ':', ';', '<', '>', '"', '\''];

/// Author or committer identity with a timestamp and timezone offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub when: i64,
    /// Timezone offset in minutes east of UTC.
    pub offset_min: i32,
}

impl Signature {
    pub fn new(name: &str, email: &str, when: i64, offset_min: i32) -> Self {
        Signature {
            name: name.trim_matches(NAME_CRUD).to_string(),
            email: email.to_string(),
            when,
            offset_min,
        }
    }

    /// Parse `Name <Email> <unixtime> <±HHMM>`. The space before `<` may
    /// be missing; anything else out of shape is an error.
    pub fn parse(s: &str) -> Result<Signature> {
        let malformed = |what: &str| Error::MalformedSignature(format!("{}: {:?}", what, s));
        let lt = s.find('<').ok_or_else(|| malformed("missing '<'"))?;
        let gt = s[lt..]
            .find('>')
            .map(|i| lt + i)
            .ok_or_else(|| malformed("missing '>'"))?;
        let name = s[..lt].trim_matches(NAME_CRUD);
        let email = &s[lt + 1..gt];
        let mut rest = s[gt + 1..].trim_start().splitn(2, ' ');
        let when = rest
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(|| malformed("bad timestamp"))?;
        let zone = rest.next().ok_or_else(|| malformed("missing timezone"))?;
        Ok(Signature {
            name: name.to_string(),
            email: email.to_string(),
            when,
            offset_min: parse_zone(zone).ok_or_else(|| malformed("bad timezone"))?,
        })
    }
}

fn parse_zone(zone: &str) -> Option<i32> {
    let bytes = zone.as_bytes();
    if bytes.len() != 5 || !bytes[1..].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let sign = match bytes[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hhmm: i32 = zone[1..].parse().ok()?;
    Some(sign * (hhmm / 100 * 60 + hhmm % 100))
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.offset_min < 0 { '-' } else { '+' };
        let m = self.offset_min.abs();
        write!(
            f,
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.when,
            sign,
            m / 60,
            m % 60
        )
    }
}

/// The five modes git allows for a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMode {
    Tree,
    Blob,
    Exec,
    Symlink,
    Gitlink,
}

impl TreeMode {
    pub fn value(&self) -> u32 {
        match self {
            TreeMode::Tree => 0o040000,
            TreeMode::Blob => 0o100644,
            TreeMode::Exec => 0o100755,
            TreeMode::Symlink => 0o120000,
            TreeMode::Gitlink => 0o160000,
        }
    }

    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            0o040000 => Some(TreeMode::Tree),
            0o100644 => Some(TreeMode::Blob),
            0o100755 => Some(TreeMode::Exec),
            0o120000 => Some(TreeMode::Symlink),
            0o160000 => Some(TreeMode::Gitlink),
            _ => None,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, TreeMode::Tree)
    }
}

/// Metadata a tree associates with an entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: TreeMode,
    pub id: ObjectId,
}

/// A mapping from entry names to tree metadata, analogous to a
/// filesystem directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Insert an entry. Names must be non-empty single path components
    /// without NUL or newline bytes; an existing entry of the same name
    /// is replaced.
    pub fn insert(&mut self, name: &str, mode: TreeMode, id: ObjectId) -> Result<()> {
        if name.is_empty() || name.contains(['\0', '\n', '/']) {
            return Err(Error::InvalidObject(format!("bad tree entry name: {:?}", name)));
        }
        self.entries.insert(name.to_string(), TreeEntry { mode, id });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    /// Entry names in the canonical git order: ascending byte-wise, with
    /// sub-tree names sorted as if they had a trailing slash.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .map(|(name, entry)| {
                if entry.mode.is_tree() {
                    format!("{}/", name)
                } else {
                    name.clone()
                }
            })
            .collect();
        names.sort();
        for name in &mut names {
            if name.ends_with('/') {
                name.pop();
            }
        }
        names
    }

    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for name in self.names() {
            let entry = &self.entries[&name];
            body.extend_from_slice(format!("{:o} {}\0", entry.mode.value(), name).as_bytes());
            body.extend_from_slice(entry.id.as_bytes());
        }
        body
    }

    fn decode(body: &[u8]) -> Result<Tree> {
        let bad = |what: &str| Error::InvalidObject(format!("tree: {}", what));
        let mut tree = Tree::new();
        let mut pos = 0;
        while pos < body.len() {
            let sp = body[pos..]
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| bad("missing space after mode"))?;
            let mode_str =
                std::str::from_utf8(&body[pos..pos + sp]).map_err(|_| bad("mode not ascii"))?;
            let value =
                u32::from_str_radix(mode_str, 8).map_err(|_| bad("mode not octal"))?;
            let mode = TreeMode::from_value(value)
                .ok_or_else(|| Error::InvalidObject(format!("tree: unknown mode {:o}", value)))?;
            pos += sp + 1;

            let nul = body[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| bad("missing NUL after name"))?;
            let name = std::str::from_utf8(&body[pos..pos + nul])
                .map_err(|_| bad("name not utf-8"))?
                .to_string();
            pos += nul + 1;

            if pos + 20 > body.len() {
                return Err(Error::UnexpectedEof);
            }
            let id = ObjectId::from_bytes(&body[pos..pos + 20]).unwrap();
            pos += 20;

            tree.insert(&name, mode, id)?;
        }
        Ok(tree)
    }
}

/// A signed label for a tree, representing one snapshot of history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: Vec<u8>,
}

/// A named label for another object, usually a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub object: ObjectId,
    pub target_type: ObjectType,
    pub tag: String,
    pub tagger: Signature,
    pub message: Vec<u8>,
}

/// A git object: the tagged union of the four kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Vec<u8>),
    Tree(Tree),
    Commit(Commit),
    Tag(Tag),
}

impl Object {
    pub fn kind(&self) -> ObjectType {
        match self {
            Object::Blob(_) => ObjectType::Blob,
            Object::Tree(_) => ObjectType::Tree,
            Object::Commit(_) => ObjectType::Commit,
            Object::Tag(_) => ObjectType::Tag,
        }
    }

    /// The object's content-address: the SHA-1 of its canonical form.
    pub fn id(&self) -> ObjectId {
        ObjectId::hash_body(self.kind(), &self.encode_body())
    }

    /// Serialize the header-less body, as stored zlib-compressed in
    /// packfiles.
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Object::Blob(data) => data.clone(),
            Object::Tree(tree) => tree.encode(),
            Object::Commit(commit) => encode_commit(commit),
            Object::Tag(tag) => encode_tag(tag),
        }
    }

    /// Decode a header-less body of a known type.
    pub fn decode_body(kind: ObjectType, body: &[u8]) -> Result<Object> {
        match kind {
            ObjectType::Blob => Ok(Object::Blob(body.to_vec())),
            ObjectType::Tree => Ok(Object::Tree(Tree::decode(body)?)),
            ObjectType::Commit => Ok(Object::Commit(decode_commit(body)?)),
            ObjectType::Tag => Ok(Object::Tag(decode_tag(body)?)),
        }
    }

    /// Serialize to the canonical form `"{type} {size}\0{body}"`.
    pub fn marshal(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut data = format!("{} {}\0", self.kind(), body.len()).into_bytes();
        data.extend_from_slice(&body);
        data
    }

    /// Parse an object from its canonical form, validating the declared
    /// type and length.
    pub fn unmarshal(data: &[u8]) -> Result<Object> {
        let nul = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidObject("missing NUL in object header".into()))?;
        let header = std::str::from_utf8(&data[..nul])
            .map_err(|_| Error::InvalidObject("object header not utf-8".into()))?;
        let (type_str, size_str) = header
            .split_once(' ')
            .ok_or_else(|| Error::InvalidObject("missing space in object header".into()))?;
        let kind = ObjectType::from_name(type_str)
            .ok_or_else(|| Error::UnknownType(type_str.to_string()))?;
        let expected: usize = size_str
            .parse()
            .map_err(|_| Error::InvalidObject("bad size in object header".into()))?;
        let body = &data[nul + 1..];
        if body.len() != expected {
            return Err(Error::ObjectSize {
                expected,
                actual: body.len(),
            });
        }
        Object::decode_body(kind, body)
    }

    /// A cheap estimate of the body size, used to order packfile
    /// emission without serializing every object twice.
    pub fn approx_size(&self) -> usize {
        match self {
            Object::Blob(data) => data.len(),
            Object::Tree(tree) => tree.iter().map(|(name, _)| 28 + name.len()).sum(),
            Object::Commit(c) => {
                6 + 40
                    + c.parents.len() * (8 + 40)
                    + 28
                    + c.author.name.len()
                    + c.author.email.len()
                    + 31
                    + c.committer.name.len()
                    + c.committer.email.len()
                    + 1
                    + c.message.len()
            }
            Object::Tag(t) => {
                8 + 40
                    + 6
                    + t.target_type.as_str().len()
                    + 5
                    + t.tag.len()
                    + 28
                    + t.tagger.name.len()
                    + t.tagger.email.len()
                    + 1
                    + t.message.len()
            }
        }
    }
}

fn encode_commit(c: &Commit) -> Vec<u8> {
    let mut text = format!("tree {}\n", c.tree);
    for parent in &c.parents {
        text.push_str(&format!("parent {}\n", parent));
    }
    text.push_str(&format!("author {}\n", c.author));
    text.push_str(&format!("committer {}\n", c.committer));
    text.push('\n');
    let mut body = text.into_bytes();
    body.extend_from_slice(&c.message);
    body
}

fn encode_tag(t: &Tag) -> Vec<u8> {
    let text = format!(
        "object {}\ntype {}\ntag {}\ntagger {}\n\n",
        t.object, t.target_type, t.tag, t.tagger
    );
    let mut body = text.into_bytes();
    body.extend_from_slice(&t.message);
    body
}

/// Split a commit or tag body into its header lines and message bytes.
/// The blank separator line is always present in the canonical form.
fn split_message(body: &[u8]) -> Result<(Vec<&str>, Vec<u8>)> {
    let boundary = body
        .windows(2)
        .position(|w| w == b"\n\n")
        .ok_or_else(|| Error::InvalidObject("missing blank line before message".into()))?;
    let headers = std::str::from_utf8(&body[..boundary])
        .map_err(|_| Error::InvalidObject("object headers not utf-8".into()))?;
    Ok((headers.lines().collect(), body[boundary + 2..].to_vec()))
}

fn field<'a>(line: Option<&&'a str>, name: &str) -> Option<&'a str> {
    line.and_then(|l| l.strip_prefix(name))
        .and_then(|l| l.strip_prefix(' '))
}

fn id_field(value: &str) -> Result<ObjectId> {
    ObjectId::from_hex(value)
        .ok_or_else(|| Error::InvalidObject(format!("bad object id: {:?}", value)))
}

fn decode_commit(body: &[u8]) -> Result<Commit> {
    let (lines, message) = split_message(body)?;
    let mut lines = lines.iter();
    let mut line = lines.next();

    let tree = id_field(
        field(line, "tree").ok_or_else(|| Error::InvalidObject("commit: missing tree".into()))?,
    )?;
    line = lines.next();

    let mut parents = Vec::new();
    while let Some(value) = field(line, "parent") {
        parents.push(id_field(value)?);
        line = lines.next();
    }

    let author = Signature::parse(
        field(line, "author")
            .ok_or_else(|| Error::InvalidObject("commit: missing author".into()))?,
    )?;
    line = lines.next();

    let committer = Signature::parse(
        field(line, "committer")
            .ok_or_else(|| Error::InvalidObject("commit: missing committer".into()))?,
    )?;

    if let Some(extra) = lines.next() {
        return Err(Error::InvalidObject(format!(
            "commit: unexpected header line: {:?}",
            extra
        )));
    }
    Ok(Commit {
        tree,
        parents,
        author,
        committer,
        message,
    })
}

fn decode_tag(body: &[u8]) -> Result<Tag> {
    let (lines, message) = split_message(body)?;
    let mut lines = lines.iter();

    let object = id_field(
        field(lines.next(), "object")
            .ok_or_else(|| Error::InvalidObject("tag: missing object".into()))?,
    )?;
    let type_name = field(lines.next(), "type")
        .ok_or_else(|| Error::InvalidObject("tag: missing type".into()))?;
    let target_type = ObjectType::from_name(type_name)
        .ok_or_else(|| Error::UnknownType(type_name.to_string()))?;
    let tag = field(lines.next(), "tag")
        .ok_or_else(|| Error::InvalidObject("tag: missing tag name".into()))?
        .to_string();
    let tagger = Signature::parse(
        field(lines.next(), "tagger")
            .ok_or_else(|| Error::InvalidObject("tag: missing tagger".into()))?,
    )?;
    if let Some(extra) = lines.next() {
        return Err(Error::InvalidObject(format!(
            "tag: unexpected header line: {:?}",
            extra
        )));
    }
    Ok(Tag {
        object,
        target_type,
        tag,
        tagger,
        message,
    })
}
