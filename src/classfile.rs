//! Minimal class-file reader and writer.
//!
//! Only the structure needed to describe a type and to append fields is
//! decoded: the constant pool, the header (access flags, this/super class,
//! interfaces) and, on demand, the field and method tables. Everything after
//! the field table is carried over byte for byte.

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use std::fmt;

const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_INTERFACE: u16 = 0x0200;

const JAVA_VERSION_OFFSET: u16 = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ClassFileVersion {
    pub major: u16,
    pub minor: u16,
}

impl ClassFileVersion {
    pub const JAVA_V8: Self = Self::of_major(52);

    pub const fn of_major(major: u16) -> Self {
        Self { major, minor: 0 }
    }

    pub fn of_java(release: u16) -> Result<Self> {
        if release == 0 {
            bail!("Unknown Java release: {release}");
        }
        release
            .checked_add(JAVA_VERSION_OFFSET)
            .map(Self::of_major)
            .ok_or_else(|| anyhow!("Unknown Java release: {release}"))
    }

    /// Parses `1.8`, `8`, `11` or `17.0.2` style specification versions.
    pub fn parse_java_version(text: &str) -> Result<Self> {
        let text = text.trim();
        let text = text.strip_prefix("1.").unwrap_or(text);
        let release = text
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Cannot parse Java version: {text}"))?
            .parse::<u16>()?;
        Self::of_java(release)
    }

    pub fn java_version(&self) -> u16 {
        self.major.saturating_sub(JAVA_VERSION_OFFSET)
    }
}

impl fmt::Display for ClassFileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Java {} ({}.{})", self.java_version(), self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberDescription {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
}

/// What plugins see of a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeDescription {
    /// Binary name with `.` separators, e.g. `a.b.Foo$Inner`.
    pub name: String,
    pub access: u16,
    pub version: ClassFileVersion,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    /// Only described by the extended pool strategy.
    pub fields: Option<Vec<MemberDescription>>,
    pub methods: Option<Vec<MemberDescription>>,
}

impl TypeDescription {
    pub fn simple_name(&self) -> &str {
        let start = self.name.rfind(['.', '$']).map(|i| i + 1).unwrap_or(0);
        &self.name[start..]
    }

    pub fn package_name(&self) -> &str {
        self.name.rfind('.').map(|i| &self.name[..i]).unwrap_or("")
    }

    pub fn is_interface(&self) -> bool {
        self.access & ACC_INTERFACE != 0
    }

    pub fn declares_field(&self, name: &str) -> Option<bool> {
        self.fields
            .as_ref()
            .map(|fields| fields.iter().any(|f| f.name == name))
    }
}

impl fmt::Display for TypeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_interface() { "interface" } else { "class" };
        write!(f, "{kind} {}", self.name)
    }
}

#[derive(Debug, Clone)]
enum Constant {
    Utf8(String),
    Class(u16),
    Other,
    /// Second slot of a long or double entry.
    Unusable,
}

#[derive(Debug, Clone)]
struct Member {
    access: u16,
    name_index: u16,
    descriptor_index: u16,
}

/// A parsed class file. Keeps the original bytes plus the offsets needed to
/// splice new constants and fields in.
#[derive(Debug, Clone)]
pub struct ClassFile {
    bytes: Vec<u8>,
    version: ClassFileVersion,
    pool: Vec<Constant>,
    pool_end: usize,
    access: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields_offset: usize,
}

#[derive(Debug, Clone)]
struct MemberTables {
    fields: Vec<Member>,
    fields_end: usize,
    methods: Vec<Member>,
}

/// A field to append when the class file is written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
}

impl ClassFile {
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let mut reader = Reader::new(&bytes);
        if reader.u32()? != MAGIC {
            bail!("Not a class file: bad magic number");
        }
        let minor = reader.u16()?;
        let major = reader.u16()?;
        let pool_count = reader.u16()?;
        if pool_count == 0 {
            bail!("Invalid constant pool count");
        }

        let mut pool = Vec::with_capacity(pool_count as usize);
        pool.push(Constant::Unusable);
        while pool.len() < pool_count as usize {
            let tag = reader.u8()?;
            match tag {
                1 => {
                    let len = reader.u16()? as usize;
                    let raw = reader.take(len)?;
                    pool.push(Constant::Utf8(String::from_utf8_lossy(raw).into_owned()));
                }
                7 => pool.push(Constant::Class(reader.u16()?)),
                8 | 16 | 19 | 20 => {
                    reader.skip(2)?;
                    pool.push(Constant::Other);
                }
                15 => {
                    reader.skip(3)?;
                    pool.push(Constant::Other);
                }
                3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => {
                    reader.skip(4)?;
                    pool.push(Constant::Other);
                }
                5 | 6 => {
                    reader.skip(8)?;
                    pool.push(Constant::Other);
                    pool.push(Constant::Unusable);
                }
                other => bail!("Unknown constant pool tag {other} at entry {}", pool.len()),
            }
        }
        if pool.len() != pool_count as usize {
            bail!("Constant pool overflows its declared size");
        }
        let pool_end = reader.pos;

        let access = reader.u16()?;
        let this_class = reader.u16()?;
        let super_class = reader.u16()?;
        let interface_count = reader.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(reader.u16()?);
        }
        let fields_offset = reader.pos;

        let class = Self {
            version: ClassFileVersion { major, minor },
            bytes,
            pool,
            pool_end,
            access,
            this_class,
            super_class,
            interfaces,
            fields_offset,
        };
        class.class_name(class.this_class)?;
        Ok(class)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn version(&self) -> ClassFileVersion {
        self.version
    }

    pub fn name(&self) -> Result<String> {
        self.class_name(self.this_class)
    }

    pub fn describe(&self, with_members: bool) -> Result<TypeDescription> {
        let super_name = if self.super_class == 0 {
            None
        } else {
            Some(self.class_name(self.super_class)?)
        };
        let interfaces = self
            .interfaces
            .iter()
            .map(|&index| self.class_name(index))
            .collect::<Result<Vec<_>>>()?;
        let (fields, methods) = if with_members {
            let tables = self.members()?;
            (
                Some(self.describe_members(&tables.fields)?),
                Some(self.describe_members(&tables.methods)?),
            )
        } else {
            (None, None)
        };
        Ok(TypeDescription {
            name: self.name()?,
            access: self.access,
            version: self.version,
            super_name,
            interfaces,
            fields,
            methods,
        })
    }

    pub fn field_names(&self) -> Result<Vec<String>> {
        let tables = self.members()?;
        tables
            .fields
            .iter()
            .map(|f| self.utf8(f.name_index).map(str::to_string))
            .collect()
    }

    /// Writes the class back with `fields` appended. Existing constant pool
    /// indices stay valid because new constants are only ever appended.
    pub fn with_fields(&self, fields: &[FieldDefinition]) -> Result<Vec<u8>> {
        if fields.is_empty() {
            return Ok(self.bytes.clone());
        }
        let tables = self.members()?;
        let existing = self.field_names()?;
        for field in fields {
            if existing.iter().any(|name| name == &field.name) {
                bail!("Field {} is already declared by {}", field.name, self.name()?);
            }
        }

        let old_count = self.pool.len();
        let new_count = old_count + fields.len() * 2;
        let name = self.name()?;
        let new_count = u16::try_from(new_count)
            .map_err(|_| anyhow!("Constant pool of {name} would overflow"))?;
        let field_count = u16::try_from(tables.fields.len() + fields.len())
            .map_err(|_| anyhow!("Field table of {name} would overflow"))?;

        let mut out = Vec::with_capacity(self.bytes.len() + fields.len() * 32);
        out.extend_from_slice(&self.bytes[..8]);
        out.extend_from_slice(&new_count.to_be_bytes());
        out.extend_from_slice(&self.bytes[10..self.pool_end]);

        let mut definitions = Vec::with_capacity(fields.len());
        let mut next_index = old_count as u16;
        for field in fields {
            let name_index = next_index;
            push_utf8(&mut out, &field.name)?;
            let descriptor_index = next_index + 1;
            push_utf8(&mut out, &field.descriptor)?;
            next_index += 2;
            definitions.push((field.access, name_index, descriptor_index));
        }

        out.extend_from_slice(&self.bytes[self.pool_end..self.fields_offset]);
        out.extend_from_slice(&field_count.to_be_bytes());
        out.extend_from_slice(&self.bytes[self.fields_offset + 2..tables.fields_end]);
        for (access, name_index, descriptor_index) in definitions {
            out.extend_from_slice(&access.to_be_bytes());
            out.extend_from_slice(&name_index.to_be_bytes());
            out.extend_from_slice(&descriptor_index.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
        }
        out.extend_from_slice(&self.bytes[tables.fields_end..]);
        Ok(out)
    }

    fn members(&self) -> Result<MemberTables> {
        let mut reader = Reader::new(&self.bytes);
        reader.pos = self.fields_offset;
        let fields = read_members(&mut reader)?;
        let fields_end = reader.pos;
        let methods = read_members(&mut reader)?;
        Ok(MemberTables {
            fields,
            fields_end,
            methods,
        })
    }

    fn describe_members(&self, members: &[Member]) -> Result<Vec<MemberDescription>> {
        members
            .iter()
            .map(|m| {
                Ok(MemberDescription {
                    access: m.access,
                    name: self.utf8(m.name_index)?.to_string(),
                    descriptor: self.utf8(m.descriptor_index)?.to_string(),
                })
            })
            .collect()
    }

    fn utf8(&self, index: u16) -> Result<&str> {
        match self.pool.get(index as usize) {
            Some(Constant::Utf8(value)) => Ok(value),
            _ => Err(anyhow!("Constant pool entry {index} is not a UTF-8 constant")),
        }
    }

    fn class_name(&self, index: u16) -> Result<String> {
        match self.pool.get(index as usize) {
            Some(Constant::Class(name_index)) => Ok(self.utf8(*name_index)?.replace('/', ".")),
            _ => Err(anyhow!("Constant pool entry {index} is not a class constant")),
        }
    }
}

fn read_members(reader: &mut Reader<'_>) -> Result<Vec<Member>> {
    let count = reader.u16()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access = reader.u16()?;
        let name_index = reader.u16()?;
        let descriptor_index = reader.u16()?;
        let attributes = reader.u16()?;
        for _ in 0..attributes {
            reader.skip(2)?;
            let len = reader.u32()? as usize;
            reader.skip(len)?;
        }
        members.push(Member {
            access,
            name_index,
            descriptor_index,
        });
    }
    Ok(members)
}

fn push_utf8(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| anyhow!("Constant too long: {value}"))?;
    out.push(1);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| anyhow!("Truncated class file at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}
