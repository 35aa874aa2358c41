/*!
 * The atom (box) tree.
 *
 * Every node is an [`Atom`] with a header, an ordered property list and ordered children. The
 * layout of a known atom comes from [`schema`]; unknown atoms keep their body verbatim. Sizes and
 * offsets are not maintained while the tree is edited: [`Atom::compute_sizes`] followed by
 * [`Atom::assign_offsets`] must run before anything is written.
 */

use std::io;

use bon::bon;

pub mod path;
pub(crate) mod schema;
pub(crate) mod util;

pub use self::util::FourCC;

use crate::{
    atom::util::serializer,
    property::{properties_size, write_properties, BitWriter, BytesFormat, Property},
    Error, Result,
};

/// Type reported for the parent of top-level atoms.
pub const ROOT: FourCC = FourCC::new(&[0, 0, 0, 0]);

pub const FTYP: &[u8; 4] = b"ftyp";
pub const MOOV: &[u8; 4] = b"moov";
pub const MDAT: &[u8; 4] = b"mdat";
pub const FREE: &[u8; 4] = b"free";
pub const SKIP: &[u8; 4] = b"skip";
pub const TRAK: &[u8; 4] = b"trak";
pub const STSD: &[u8; 4] = b"stsd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    /// The pseudo atom owning the top-level atoms of a file. Has no header.
    Root,
    /// Known type, parsed into typed properties and children.
    Schema,
    /// Unknown type; the body is kept as a single `data` property.
    Raw,
    /// Top-level `mdat`/`free`/`skip`: only the extent is tracked, the payload stays on disk.
    OnDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomHeader {
    pub atom_type: FourCC,
    /// Absolute offset of the first header byte.
    pub start: u64,
    pub size: u64,
    /// 8, or 16 for the 64-bit form. 0 for the root.
    pub header_size: u8,
    /// The size field held the 0 "extends to end" sentinel when parsed.
    pub extends_to_end: bool,
}

impl AtomHeader {
    pub fn new(atom_type: FourCC) -> Self {
        Self {
            atom_type,
            start: 0,
            size: 8,
            header_size: 8,
            extends_to_end: false,
        }
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn body_start(&self) -> u64 {
        self.start + u64::from(self.header_size)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub(crate) header: AtomHeader,
    /// Type of the enclosing atom, which selects between same-named layouts (`rtp `).
    pub(crate) parent_type: FourCC,
    pub(crate) kind: AtomKind,
    pub(crate) properties: Vec<Property>,
    pub(crate) children: Vec<Atom>,
    /// Unparsed bytes at the end of the body.
    pub(crate) trailing: Vec<u8>,
}

// construction
impl Atom {
    pub fn root() -> Self {
        Self {
            header: AtomHeader {
                header_size: 0,
                size: 0,
                ..AtomHeader::new(ROOT)
            },
            parent_type: ROOT,
            kind: AtomKind::Root,
            properties: Vec::new(),
            children: Vec::new(),
            trailing: Vec::new(),
        }
    }

    /// An atom with the layout for `atom_type` under `parent_type` and zeroed values. The
    /// version is taken from `version` for atoms that carry one.
    pub(crate) fn with_version(atom_type: FourCC, parent_type: FourCC, version: u8) -> Self {
        let (kind, properties) = match schema::template(atom_type, parent_type, version) {
            Some(template) => (AtomKind::Schema, template.properties),
            None => (
                AtomKind::Raw,
                vec![Property::blob("data", BytesFormat::ToEnd)],
            ),
        };
        Self {
            header: AtomHeader::new(atom_type),
            parent_type,
            kind,
            properties,
            children: Vec::new(),
            trailing: Vec::new(),
        }
    }

    /// Top-level atom whose payload lives in the file.
    pub(crate) fn on_disk(header: AtomHeader) -> Self {
        Self {
            header,
            parent_type: ROOT,
            kind: AtomKind::OnDisk,
            properties: Vec::new(),
            children: Vec::new(),
            trailing: Vec::new(),
        }
    }

    /// A synthetic atom with generated defaults and its required children.
    pub fn generate(atom_type: FourCC, parent_type: FourCC) -> Self {
        if parent_type == ROOT && [MDAT, FREE, SKIP].contains(&&atom_type.0) {
            return Self::on_disk(AtomHeader::new(atom_type));
        }
        let mut atom = Self::with_version(atom_type, parent_type, schema::generated_version(atom_type));
        schema::generated_properties(atom_type, &mut atom.properties);
        for child in schema::required_children(atom_type, parent_type) {
            atom.children
                .push(Self::generate(FourCC::new(child), atom_type));
        }
        atom
    }
}

// accessors
impl Atom {
    pub fn header(&self) -> &AtomHeader {
        &self.header
    }

    pub fn atom_type(&self) -> FourCC {
        self.header.atom_type
    }

    pub fn parent_type(&self) -> FourCC {
        self.parent_type
    }

    pub fn kind(&self) -> AtomKind {
        self.kind
    }

    pub fn start(&self) -> u64 {
        self.header.start
    }

    pub fn size(&self) -> u64 {
        self.header.size
    }

    pub fn end(&self) -> u64 {
        self.header.end()
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut [Property] {
        &mut self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties
            .iter_mut()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn children(&self) -> &[Atom] {
        &self.children
    }

    pub fn child(&self, atom_type: &[u8; 4]) -> Option<&Atom> {
        self.children.iter().find(|a| a.atom_type() == atom_type)
    }

    pub fn child_mut(&mut self, atom_type: &[u8; 4]) -> Option<&mut Atom> {
        self.children.iter_mut().find(|a| a.atom_type() == atom_type)
    }

    pub fn child_position(&self, atom_type: &[u8; 4]) -> Option<usize> {
        self.children.iter().position(|a| a.atom_type() == atom_type)
    }

    pub fn version(&self) -> u8 {
        self.property("version")
            .and_then(|p| p.integer(0).ok())
            .map_or(0, |v| v as u8)
    }

    pub fn flags(&self) -> u32 {
        self.property("flags")
            .and_then(|p| p.integer(0).ok())
            .map_or(0, |v| v as u32)
    }

    pub(crate) fn child_at_mut(&mut self, index: usize) -> Option<&mut Atom> {
        self.children.get_mut(index)
    }
}

// structural mutation
impl Atom {
    pub fn add_child(&mut self, child: Atom) -> &mut Atom {
        let index = self.children.len();
        self.insert_child(index, child)
    }

    /// Inserts at `index`, clamped to the number of children.
    pub fn insert_child(&mut self, index: usize, mut child: Atom) -> &mut Atom {
        let index = index.min(self.children.len());
        child.parent_type = self.atom_type();
        self.children.insert(index, child);
        &mut self.children[index]
    }

    pub fn delete_child(&mut self, index: usize) -> Result<Atom> {
        if index >= self.children.len() {
            return Err(Error::not_found(format!(
                "{}.children[{index}]",
                self.atom_type()
            )));
        }
        Ok(self.children.remove(index))
    }

    pub fn find_atom(&self, path: &str) -> Option<&Atom> {
        let indices = path::atom_indices(self, path)?;
        Some(indices.iter().fold(self, |atom, &i| &atom.children[i]))
    }

    pub fn find_atom_mut(&mut self, path: &str) -> Option<&mut Atom> {
        let indices = path::atom_indices(self, path)?;
        indices
            .into_iter()
            .try_fold(self, |atom, i| atom.children.get_mut(i))
    }

    pub fn find_property(&self, path: &str) -> Option<&Property> {
        path::PropertyHandle::resolve(self, path)?.get(self)
    }

    pub fn find_property_mut(&mut self, path: &str) -> Option<&mut Property> {
        path::PropertyHandle::resolve(self, path)?.get_mut(self)
    }
}

// typed access by path
impl Atom {
    fn located(&self, path: &str) -> Result<(path::PropertyHandle, &Property)> {
        let handle = path::PropertyHandle::resolve(self, path)
            .ok_or_else(|| Error::not_found(path.to_string()))?;
        let property = handle
            .get(self)
            .ok_or_else(|| Error::not_found(path.to_string()))?;
        Ok((handle, property))
    }

    fn located_mut(&mut self, path: &str) -> Result<(usize, &mut Property)> {
        let handle = path::PropertyHandle::resolve(self, path)
            .ok_or_else(|| Error::not_found(path.to_string()))?;
        let property = handle
            .get_mut(self)
            .ok_or_else(|| Error::not_found(path.to_string()))?;
        Ok((handle.index, property))
    }

    pub fn integer_property(&self, path: &str) -> Result<u64> {
        let (handle, property) = self.located(path)?;
        property.integer(handle.index)
    }

    pub fn set_integer_property(&mut self, path: &str, value: u64) -> Result<()> {
        let (index, property) = self.located_mut(path)?;
        property.set_integer(index, value)
    }

    pub fn float_property(&self, path: &str) -> Result<f32> {
        let (handle, property) = self.located(path)?;
        property.float(handle.index)
    }

    pub fn set_float_property(&mut self, path: &str, value: f32) -> Result<()> {
        let (index, property) = self.located_mut(path)?;
        property.set_float(index, value)
    }

    pub fn string_property(&self, path: &str) -> Result<String> {
        let (handle, property) = self.located(path)?;
        property.string(handle.index)
    }

    pub fn set_string_property(&mut self, path: &str, value: &str) -> Result<()> {
        let (index, property) = self.located_mut(path)?;
        property.set_string(index, value)
    }

    pub fn bytes_property(&self, path: &str) -> Result<Vec<u8>> {
        let (handle, property) = self.located(path)?;
        property.bytes(handle.index)
    }

    pub fn set_bytes_property(&mut self, path: &str, value: Vec<u8>) -> Result<()> {
        let (index, property) = self.located_mut(path)?;
        property.set_bytes(index, value)
    }
}

#[bon]
impl Atom {
    /// Returns the first child of `atom_type`, generating it when missing.
    #[builder]
    pub fn find_or_insert_child(
        &mut self,
        #[builder(start_fn)] atom_type: &[u8; 4],
        /// Position for a newly generated child; appended when unset.
        insert_index: Option<usize>,
    ) -> &mut Atom {
        match self.child_position(atom_type) {
            Some(index) => &mut self.children[index],
            None => {
                let child = Atom::generate(FourCC::new(atom_type), self.atom_type());
                let index = insert_index.unwrap_or(self.children.len());
                self.insert_child(index, child)
            }
        }
    }
}

// layout
impl Atom {
    fn body_size(&self) -> u64 {
        properties_size(&self.properties)
            + self.children.iter().map(Atom::size).sum::<u64>()
            + self.trailing.len() as u64
    }

    /// Recomputes every size bottom-up. On-disk atoms keep their recorded size.
    pub fn compute_sizes(&mut self) -> u64 {
        for child in &mut self.children {
            child.compute_sizes();
        }
        match self.kind {
            AtomKind::OnDisk => {}
            AtomKind::Root => self.header.size = self.body_size(),
            AtomKind::Schema | AtomKind::Raw => {
                let body = self.body_size();
                if self.header.header_size != 16 && body + 8 > u64::from(u32::MAX) {
                    self.header.header_size = 16;
                }
                self.header.size = u64::from(self.header.header_size) + body;
            }
        }
        self.header.size
    }

    /// Assigns absolute offsets top-down starting at `start`. Sizes must be current.
    pub fn assign_offsets(&mut self, start: u64) {
        self.header.start = start;
        let mut position = self.header.body_start() + properties_size(&self.properties);
        for child in &mut self.children {
            child.assign_offsets(position);
            position += child.size();
        }
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        serializer::atom_header(self.atom_type(), self.size(), self.header.header_size)
    }

    /// Serializes the atom. On-disk atoms contribute their header only.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        if self.kind != AtomKind::Root {
            out.extend(self.header_bytes());
        }
        if self.kind == AtomKind::OnDisk {
            return;
        }
        write_properties(&mut BitWriter::new(out), &self.properties);
        for child in &self.children {
            child.write_to(out);
        }
        out.extend_from_slice(&self.trailing);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        self.write_to(&mut out);
        out
    }

    pub fn dump(
        &self,
        out: &mut dyn io::Write,
        indent: usize,
        dump_implicits: bool,
    ) -> io::Result<()> {
        let mut indent = indent;
        if self.kind != AtomKind::Root {
            writeln!(
                out,
                "{:pad$}type {} (start {}, size {})",
                "",
                self.atom_type(),
                self.start(),
                self.size(),
                pad = indent * 2
            )?;
            indent += 1;
        }
        for property in &self.properties {
            property.dump(out, indent, dump_implicits)?;
        }
        for child in &self.children {
            child.dump(out, indent, dump_implicits)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_moov_tree() {
        let moov = Atom::generate(FourCC::new(MOOV), ROOT);
        let types: Vec<_> = moov.children().iter().map(Atom::atom_type).collect();
        assert_eq!(types, vec![FourCC::new(b"mvhd"), FourCC::new(b"iods")]);
        let mvhd = moov.child(b"mvhd").unwrap();
        assert_eq!(mvhd.version(), 1);
        assert_eq!(mvhd.property("nextTrackId").unwrap().integer(0).unwrap(), 1);
        assert_eq!(mvhd.property("timeScale").unwrap().integer(0).unwrap(), 1000);
    }

    #[test]
    fn test_generate_stbl_children() {
        let stbl = Atom::generate(FourCC::new(b"stbl"), FourCC::new(b"minf"));
        let types: Vec<String> = stbl
            .children()
            .iter()
            .map(|a| a.atom_type().to_string())
            .collect();
        assert_eq!(types, vec!["stsd", "stts", "stsc", "stsz", "stco"]);
    }

    #[test]
    fn test_sizes_and_offsets() {
        let mut root = Atom::root();
        root.add_child(Atom::generate(FourCC::new(FTYP), ROOT));
        root.add_child(Atom::generate(FourCC::new(MOOV), ROOT));
        root.compute_sizes();
        root.assign_offsets(0);

        let ftyp = &root.children()[0];
        // majorBrand + minorVersion + two compatible brands
        assert_eq!(ftyp.size(), 8 + 16);
        let moov = &root.children()[1];
        assert_eq!(moov.start(), ftyp.end());
        let children: u64 = moov.children().iter().map(Atom::size).sum();
        assert_eq!(moov.size(), 8 + children);
        for child in moov.children() {
            assert!(child.start() >= moov.start() + 8);
            assert!(child.end() <= moov.end());
        }
        assert_eq!(root.to_bytes().len() as u64, root.size());
    }

    #[test]
    fn test_find_or_insert_child() {
        let mut moov = Atom::generate(FourCC::new(MOOV), ROOT);
        moov.find_or_insert_child(b"udta")
            .call()
            .find_or_insert_child(b"hnti")
            .call();
        assert_eq!(moov.children().len(), 3);
        moov.find_or_insert_child(b"udta").call();
        assert_eq!(moov.children().len(), 3);
        assert!(moov.find_atom("udta.hnti").is_some());
    }

    #[test]
    fn test_insert_child_sets_parent_type() {
        let mut stsd = Atom::generate(FourCC::new(STSD), FourCC::new(b"stbl"));
        let entry = Atom::generate(FourCC::new(b"rtp "), FourCC::new(STSD));
        let entry = stsd.add_child(entry);
        assert_eq!(entry.parent_type(), FourCC::new(STSD));
        assert!(entry.property("maxPacketSize").is_some());
        assert!(stsd.delete_child(3).is_err());
    }
}
