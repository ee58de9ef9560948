//! Static course catalog: display names and group-access links.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static COURSE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,23}$").expect("valid course id regex"));

/// Course ids are used as store keys and inside callback data, so they are
/// restricted to a short ASCII token.
pub fn is_valid_course_id(id: &str) -> bool {
    COURSE_ID_RE.is_match(id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseMeta {
    pub id: String,
    pub name: String,
    pub group_link: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    courses: Vec<CourseMeta>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Build from `(course, aliases)` pairs. Later duplicates override earlier ones;
    /// config validation rejects duplicates before this point.
    pub fn new(entries: impl IntoIterator<Item = (CourseMeta, Vec<String>)>) -> Self {
        let mut catalog = Catalog::default();
        for (meta, aliases) in entries {
            let pos = catalog.courses.len();
            catalog.index.insert(meta.id.clone(), pos);
            for alias in aliases {
                catalog.index.insert(alias, pos);
            }
            catalog.courses.push(meta);
        }
        catalog
    }

    pub fn get(&self, course_id: &str) -> Option<&CourseMeta> {
        self.index.get(course_id).map(|&pos| &self.courses[pos])
    }

    /// Lookup that never fails: unknown ids are shown by their raw id, without a link.
    pub fn lookup(&self, course_id: &str) -> CourseMeta {
        self.get(course_id).cloned().unwrap_or_else(|| CourseMeta {
            id: course_id.to_string(),
            name: course_id.to_string(),
            group_link: None,
        })
    }

    pub fn courses(&self) -> &[CourseMeta] {
        &self.courses
    }
}
