/*!
 * Dotted path lookup, e.g. `moov.trak[1].mdia.mdhd.timeScale`.
 *
 * A path is a list of segments separated by `.`, each an atom type or property name with an
 * optional zero based `[index]`. Atom segments count only children of the named type; `*`
 * matches any type. The path is relative to the atom it is resolved against and never names
 * that atom itself.
 *
 * Properties are found through a [`PropertyHandle`], which records child and property indices
 * rather than references so that it can be kept across calls and used mutably.
 */

use winnow::{
    ascii::dec_uint,
    combinator::{delimited, opt, separated},
    token::take_till,
    ModalResult, Parser,
};

use crate::{atom::Atom, property::Property};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'p> {
    pub name: &'p str,
    pub index: Option<usize>,
}

fn segment<'p>(input: &mut &'p str) -> ModalResult<Segment<'p>> {
    (
        take_till(1.., ['.', '[']),
        opt(delimited('[', dec_uint::<_, usize, _>, ']')),
    )
        .map(|(name, index)| Segment { name, index })
        .parse_next(input)
}

/// Splits a path into segments. `None` when the path is malformed.
pub fn parse(path: &str) -> Option<Vec<Segment<'_>>> {
    separated(1.., segment, '.').parse(path).ok()
}

/// Step taken below the first property of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hop {
    /// Into descriptor `descriptor` of the current descriptor array, then its property `property`.
    Descriptor { descriptor: usize, property: usize },
    /// Into a column of the current table.
    Column(usize),
}

/// Location of a property (and a value index within it) relative to some atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyHandle {
    /// Child indices from the atom the handle was resolved against.
    pub(crate) atoms: Vec<usize>,
    pub(crate) property: usize,
    pub(crate) hops: Vec<Hop>,
    /// Value, row or descriptor index addressed by the path.
    pub index: usize,
}

struct Found {
    property: usize,
    hops: Vec<Hop>,
    index: usize,
}

impl Found {
    fn through(self, property: usize, descriptor: usize) -> Self {
        let mut hops = vec![Hop::Descriptor {
            descriptor,
            property: self.property,
        }];
        hops.extend(self.hops);
        Found {
            property,
            hops,
            index: self.index,
        }
    }
}

fn search_properties(properties: &[Property], segments: &[Segment<'_>]) -> Option<Found> {
    let (first, rest) = segments.split_first()?;
    for (i, property) in properties.iter().enumerate() {
        if property.name().is_empty() {
            // unnamed descriptor arrays are looked through
            let Some(descriptor) = property.descriptors().and_then(|d| d.first()) else {
                continue;
            };
            if let Some(found) = search_properties(descriptor.properties(), segments) {
                return Some(found.through(i, 0));
            }
            continue;
        }
        if !property.name().eq_ignore_ascii_case(first.name) {
            continue;
        }
        if let Some(columns) = property.columns() {
            let [column] = rest else {
                return None;
            };
            let c = columns
                .iter()
                .position(|p| p.name().eq_ignore_ascii_case(column.name))?;
            return Some(Found {
                property: i,
                hops: vec![Hop::Column(c)],
                index: first.index.or(column.index).unwrap_or(0),
            });
        }
        if let Some(descriptors) = property.descriptors() {
            let d = first.index.unwrap_or(0);
            if rest.is_empty() {
                return Some(Found {
                    property: i,
                    hops: Vec::new(),
                    index: d,
                });
            }
            let descriptor = descriptors.get(d)?;
            return search_properties(descriptor.properties(), rest).map(|f| f.through(i, d));
        }
        if !rest.is_empty() {
            return None;
        }
        return Some(Found {
            property: i,
            hops: Vec::new(),
            index: first.index.unwrap_or(0),
        });
    }
    None
}

fn find_child(atom: &Atom, segment: &Segment<'_>) -> Option<usize> {
    atom.children()
        .iter()
        .enumerate()
        .filter(|(_, child)| child.atom_type().matches_name(segment.name))
        .nth(segment.index.unwrap_or(0))
        .map(|(i, _)| i)
}

fn search_atom(
    atom: &Atom,
    segments: &[Segment<'_>],
    atoms: &mut Vec<usize>,
) -> Option<Found> {
    if let Some(found) = search_properties(atom.properties(), segments) {
        return Some(found);
    }
    let (first, rest) = segments.split_first()?;
    if rest.is_empty() {
        return None;
    }
    let index = find_child(atom, first)?;
    atoms.push(index);
    search_atom(&atom.children()[index], rest, atoms)
}

/// Child indices leading from `atom` to the atom named by `path`.
pub(crate) fn atom_indices(atom: &Atom, path: &str) -> Option<Vec<usize>> {
    let segments = parse(path)?;
    let mut indices = Vec::with_capacity(segments.len());
    let mut current = atom;
    for segment in &segments {
        let index = find_child(current, segment)?;
        indices.push(index);
        current = &current.children()[index];
    }
    Some(indices)
}

impl PropertyHandle {
    pub fn resolve(atom: &Atom, path: &str) -> Option<Self> {
        let segments = parse(path)?;
        let mut atoms = Vec::new();
        let found = search_atom(atom, &segments, &mut atoms)?;
        Some(Self {
            atoms,
            property: found.property,
            hops: found.hops,
            index: found.index,
        })
    }

    pub fn get<'a>(&self, atom: &'a Atom) -> Option<&'a Property> {
        let atom = self
            .atoms
            .iter()
            .try_fold(atom, |atom, &i| atom.children().get(i))?;
        let mut property = atom.properties().get(self.property)?;
        for hop in &self.hops {
            property = match *hop {
                Hop::Descriptor {
                    descriptor,
                    property: p,
                } => property
                    .descriptors()?
                    .get(descriptor)?
                    .properties()
                    .get(p)?,
                Hop::Column(c) => property.columns()?.get(c)?,
            };
        }
        Some(property)
    }

    pub fn get_mut<'a>(&self, atom: &'a mut Atom) -> Option<&'a mut Property> {
        let atom = self
            .atoms
            .iter()
            .try_fold(atom, |atom, &i| atom.child_at_mut(i))?;
        let mut property = atom.properties_mut().get_mut(self.property)?;
        for hop in &self.hops {
            property = match *hop {
                Hop::Descriptor {
                    descriptor,
                    property: p,
                } => property
                    .descriptors_mut()?
                    .get_mut(descriptor)?
                    .properties_mut()
                    .get_mut(p)?,
                Hop::Column(c) => property.columns_mut()?.get_mut(c)?,
            };
        }
        Some(property)
    }

    /// Sibling properties of the handle's first property, for keeping table counts in step.
    pub(crate) fn atom_properties_mut<'a>(&self, atom: &'a mut Atom) -> Option<&'a mut [Property]> {
        let atom = self
            .atoms
            .iter()
            .try_fold(atom, |atom, &i| atom.child_at_mut(i))?;
        Some(atom.properties_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{FourCC, MOOV, ROOT};

    #[test]
    fn test_parse_segments() {
        let segments = parse("moov.trak[2].rtp .sdpText").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment { name: "moov", index: None },
                Segment { name: "trak", index: Some(2) },
                Segment { name: "rtp ", index: None },
                Segment { name: "sdpText", index: None },
            ]
        );
        assert!(parse("moov..mvhd").is_none());
        assert!(parse("moov.trak[x]").is_none());
        assert!(parse("").is_none());
    }

    fn movie() -> Atom {
        let mut root = Atom::root();
        root.add_child(Atom::generate(FourCC::new(MOOV), ROOT));
        for _ in 0..2 {
            root.children[0].add_child(Atom::generate(FourCC::new(b"trak"), FourCC::new(MOOV)));
        }
        root
    }

    #[test]
    fn test_find_atom_by_index_and_wildcard() {
        let root = movie();
        assert!(root.find_atom("moov.trak[1].mdia.minf.stbl").is_some());
        assert!(root.find_atom("moov.trak[2]").is_none());
        assert_eq!(
            root.find_atom("moov.*[0]").unwrap().atom_type(),
            FourCC::new(b"mvhd")
        );
        assert_eq!(
            root.find_atom("MOOV.TRAK").unwrap().atom_type(),
            FourCC::new(b"trak")
        );
    }

    #[test]
    fn test_find_property_through_unnamed_descriptors() {
        let root = movie();
        let level = root.find_property("moov.iods.audioProfileLevelId").unwrap();
        assert_eq!(level.integer(0).unwrap(), 0xFF);
        let handle = PropertyHandle::resolve(&root, "moov.iods.audioProfileLevelId").unwrap();
        assert_eq!(handle.atoms, vec![0, 1]);
        assert!(matches!(handle.hops[..], [Hop::Descriptor { descriptor: 0, .. }]));
    }

    #[test]
    fn test_table_rows_either_way() {
        let mut root = movie();
        let stts = root.find_atom_mut("moov.trak.mdia.minf.stbl.stts").unwrap();
        for delta in [10, 20] {
            let row = crate::property::add_table_row(stts.properties_mut(), "entries").unwrap();
            stts.property_mut("entries")
                .unwrap()
                .column_mut("sampleDelta")
                .unwrap()
                .set_integer(row, delta)
                .unwrap();
        }
        let a = PropertyHandle::resolve(&root, "moov.trak.mdia.minf.stbl.stts.entries[1].sampleDelta")
            .unwrap();
        let b = PropertyHandle::resolve(&root, "moov.trak.mdia.minf.stbl.stts.entries.sampleDelta[1]")
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get(&root).unwrap().integer(a.index).unwrap(), 20);
    }

    #[test]
    fn test_handle_mutation() {
        let mut root = movie();
        let handle = PropertyHandle::resolve(&root, "moov.trak[1].tkhd.trackId").unwrap();
        handle.get_mut(&mut root).unwrap().set_integer(0, 7).unwrap();
        let value = root.find_property("moov.trak[1].tkhd.trackId").unwrap();
        assert_eq!(value.integer(0).unwrap(), 7);
        assert!(root.find_property("moov.trak[0].tkhd.trackId.bogus").is_none());
        assert!(root.find_property("moov.mvhd.bogus").is_none());
    }
}
