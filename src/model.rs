//! Remote object shapes and the token/DataField vocabulary (spec.md §3).

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

pub type ObjectId = String;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Semester {
    pub id: ObjectId,
    pub name: String,
    pub lexical: String,
    pub lexical_short: String,
    pub start_date: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Course {
    pub id: ObjectId,
    pub name: String,
    pub abbrev: String,
    pub course_type: String,
    pub type_abbrev: String,
    pub class: String,
    pub semester: Semester,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct File {
    pub id: ObjectId,
    pub name: String,
    pub description: String,
    pub author: String,
    pub size: Option<u64>,
    pub created: DateTime<Utc>,
    pub changed: DateTime<Utc>,
    pub is_folder: bool,
    pub is_accessible: bool,
    pub is_single_child: bool,
    pub parent: Option<ObjectId>,
    pub path: Vec<String>,
    pub course: Course,
}

/// Which remote-object kind is known at a VP node (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataField {
    Semester,
    Course,
    File,
}

impl fmt::Display for DataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataField::Semester => write!(f, "Semester"),
            DataField::Course => write!(f, "Course"),
            DataField::File => write!(f, "File"),
        }
    }
}

/// Subset of {Semester, Course, File} known at a node, with the concrete
/// remote objects attached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownData {
    pub semester: Option<Semester>,
    pub course: Option<Course>,
    pub file: Option<File>,
    /// The course's root folder, set once it's first resolved and carried
    /// unchanged through any deeper `with_file` calls made while expanding
    /// into its children (spec.md §4.6's "Allgemeiner Dateiordner"/
    /// "Hauptordner" single-child rule needs to see it even once `file` has
    /// moved on to a descendant).
    pub root_folder: Option<File>,
}

impl KnownData {
    pub fn fields(&self) -> Vec<DataField> {
        let mut out = Vec::new();
        if self.semester.is_some() {
            out.push(DataField::Semester);
        }
        if self.course.is_some() {
            out.push(DataField::Course);
        }
        if self.file.is_some() {
            out.push(DataField::File);
        }
        out
    }

    pub fn has(&self, field: DataField) -> bool {
        match field {
            DataField::Semester => self.semester.is_some(),
            DataField::Course => self.course.is_some(),
            DataField::File => self.file.is_some(),
        }
    }

    /// `self` is a superset of `other`'s known fields.
    pub fn is_superset_of(&self, other: &KnownData) -> bool {
        other.fields().iter().all(|f| self.has(*f))
    }

    pub fn with_semester(&self, semester: Semester) -> KnownData {
        let mut d = self.clone();
        d.semester = Some(semester);
        d
    }

    pub fn with_course(&self, course: Course) -> KnownData {
        let mut d = self.clone();
        d.course = Some(course);
        d
    }

    pub fn with_file(&self, file: File) -> KnownData {
        let mut d = self.clone();
        d.file = Some(file);
        d
    }

    pub fn with_root_folder(&self, root_folder: File) -> KnownData {
        let mut d = self.clone();
        d.root_folder = Some(root_folder);
        d
    }

    /// Render every token derivable from the currently-known objects.
    pub fn tokens(&self) -> BTreeMap<String, String> {
        let mut tokens = BTreeMap::new();
        if let Some(s) = &self.semester {
            tokens.insert("semester".into(), s.name.clone());
            tokens.insert("semester-lexical".into(), s.lexical.clone());
            tokens.insert("semester-lexical-short".into(), s.lexical_short.clone());
            tokens.insert("time".into(), s.lexical.clone());
        }
        if let Some(c) = &self.course {
            tokens.insert("course".into(), c.name.clone());
            tokens.insert("course-id".into(), c.id.clone());
            tokens.insert("type".into(), c.course_type.clone());
            tokens.insert("type-abbrev".into(), c.type_abbrev.clone());
            tokens.insert("class".into(), c.class.clone());
        }
        if let Some(file) = &self.file {
            tokens.insert("id".into(), file.id.clone());
            tokens.insert("name".into(), file.name.clone());
            tokens.insert("description".into(), file.description.clone());
            tokens.insert("author".into(), file.author.clone());
            tokens.insert("created".into(), file.created.to_rfc3339());
            tokens.insert("changed".into(), file.changed.to_rfc3339());
            let path = file.path.join("/");
            let mut short_path = path.clone();
            // Skip "Allgemeiner Dateiordner"/"Hauptordner" in the rendered
            // short path when it's the only object in the course root dir.
            if let Some(root) = &self.root_folder {
                if root.is_single_child
                    && matches!(root.name.as_str(), "Allgemeiner Dateiordner" | "Hauptordner")
                {
                    short_path = crate::path_util::tail(&short_path);
                }
            }
            tokens.insert("path".into(), path);
            tokens.insert("short-path".into(), short_path);
        }
        tokens
    }

    /// Most-specific known object for ctime/mtime purposes: File > Course >
    /// Semester (spec.md §4.6 `getattr`).
    pub fn most_specific_times(&self) -> Option<DateTime<Utc>> {
        if let Some(f) = &self.file {
            Some(f.changed)
        } else if let Some(c) = &self.course {
            Some(c.semester.start_date)
        } else {
            self.semester.as_ref().map(|s| s.start_date)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn semester() -> Semester {
        Semester {
            id: "ws17".into(),
            name: "Wintersemester 2017/18".into(),
            lexical: "2017W".into(),
            lexical_short: "17W".into(),
            start_date: Utc.with_ymd_and_hms(2017, 10, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn superset_rule() {
        let parent = KnownData::default().with_semester(semester());
        let child = parent.clone();
        assert!(child.is_superset_of(&parent));
        assert!(!parent.is_superset_of(&child.with_course(Course {
            id: "1".into(),
            name: "Algo".into(),
            abbrev: "A".into(),
            course_type: "V".into(),
            type_abbrev: "V".into(),
            class: "lecture".into(),
            semester: semester(),
        })));
    }

    #[test]
    fn tokens_include_semester_lexical() {
        let kd = KnownData::default().with_semester(semester());
        assert_eq!(kd.tokens().get("semester-lexical").unwrap(), "2017W");
    }

    fn course() -> Course {
        Course {
            id: "c1".into(),
            name: "Algorithms".into(),
            abbrev: "Algo".into(),
            course_type: "V".into(),
            type_abbrev: "V".into(),
            class: "lecture".into(),
            semester: semester(),
        }
    }

    fn file(path: Vec<&str>) -> File {
        File {
            id: "f1".into(),
            name: "slides.pdf".into(),
            description: String::new(),
            author: String::new(),
            size: Some(1),
            created: semester().start_date,
            changed: semester().start_date,
            is_folder: false,
            is_accessible: true,
            is_single_child: false,
            parent: None,
            path: path.into_iter().map(str::to_owned).collect(),
            course: course(),
        }
    }

    #[test]
    fn short_path_equals_path_by_default() {
        let kd = KnownData::default().with_file(file(vec!["Woche1", "Folien"]));
        let tokens = kd.tokens();
        assert_eq!(tokens.get("path").unwrap(), "Woche1/Folien");
        assert_eq!(tokens.get("short-path").unwrap(), "Woche1/Folien");
    }

    #[test]
    fn short_path_trims_single_child_hauptordner_root() {
        let root = File {
            is_single_child: true,
            name: "Hauptordner".into(),
            ..file(vec![])
        };
        let kd = KnownData::default()
            .with_file(file(vec!["Hauptordner", "Woche1"]))
            .with_root_folder(root);
        let tokens = kd.tokens();
        assert_eq!(tokens.get("path").unwrap(), "Hauptordner/Woche1");
        assert_eq!(tokens.get("short-path").unwrap(), "Woche1");
    }

    #[test]
    fn short_path_untrimmed_when_root_has_siblings() {
        let root = File {
            is_single_child: false,
            name: "Hauptordner".into(),
            ..file(vec![])
        };
        let kd = KnownData::default()
            .with_file(file(vec!["Hauptordner", "Woche1"]))
            .with_root_folder(root);
        let tokens = kd.tokens();
        assert_eq!(tokens.get("short-path").unwrap(), "Hauptordner/Woche1");
    }
}
