//! Course and usage identifiers.
//!
//! Only the two textual forms the platform emits are understood: the current
//! `course-v1:` / `block-v1:` keys and the deprecated slash separated ones.
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const COURSE_PREFIX: &str = "course-v1:";
const BLOCK_PREFIX: &str = "block-v1:";
const DEPRECATED_USAGE_PREFIX: &str = "i4x://";
const DEPRECATED_TAG: &str = "i4x";

static ALLOWED_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w\-~.:%]+$").unwrap());
static NOT_HTML_SAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w-]").unwrap());
static COURSE_IN_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*?/courses/(?P<course_key>[^/+]+(/|\+)[^/+]+(/|\+)[^/?]+)").unwrap()
});

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid course key: {0}")]
    InvalidCourseKey(String),
    #[error("invalid usage key: {0}")]
    InvalidUsageKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CourseKey {
    pub org: String,
    pub course: String,
    pub run: String,
    pub deprecated: bool,
}

fn valid_parts<const N: usize>(parts: &[&str]) -> bool {
    parts.len() == N && parts.iter().all(|part| ALLOWED_ID.is_match(part))
}

impl FromStr for CourseKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (parts, deprecated): (Vec<&str>, bool) = match s.strip_prefix(COURSE_PREFIX) {
            Some(rest) => (rest.split('+').collect(), false),
            None => (s.split('/').collect(), true),
        };

        if !valid_parts::<3>(&parts) {
            return Err(KeyError::InvalidCourseKey(s.to_owned()));
        }

        Ok(CourseKey {
            org: parts[0].to_owned(),
            course: parts[1].to_owned(),
            run: parts[2].to_owned(),
            deprecated,
        })
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.deprecated {
            write!(f, "{}/{}/{}", self.org, self.course, self.run)
        } else {
            write!(f, "{}{}+{}+{}", COURSE_PREFIX, self.org, self.course, self.run)
        }
    }
}

/// Find the course a request is about from its path, e.g. `/courses/<key>/courseware`.
pub fn course_key_from_path(path: &str) -> Option<CourseKey> {
    COURSE_IN_PATH
        .captures(path)
        .and_then(|captures| captures.name("course_key"))
        .and_then(|key| key.as_str().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub course_key: CourseKey,
    pub block_type: String,
    pub block_id: String,
}

impl UsageKey {
    /// An identifier usable as an HTML `id` attribute.
    pub fn html_id(&self) -> String {
        if self.course_key.deprecated {
            let id = [
                DEPRECATED_TAG,
                &self.course_key.org,
                &self.course_key.course,
                &self.block_type,
                &self.block_id,
            ]
            .join("-");
            NOT_HTML_SAFE.replace_all(&id, "_").into_owned()
        } else {
            self.block_id.clone()
        }
    }
}

impl FromStr for UsageKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KeyError::InvalidUsageKey(s.to_owned());

        if let Some(rest) = s.strip_prefix(BLOCK_PREFIX) {
            let parts: Vec<&str> = rest.split('+').collect();
            if parts.len() != 5 {
                return Err(invalid());
            }
            let block_type = parts[3].strip_prefix("type@").ok_or_else(invalid)?;
            let block_id = parts[4].strip_prefix("block@").ok_or_else(invalid)?;
            if !valid_parts::<5>(&[parts[0], parts[1], parts[2], block_type, block_id]) {
                return Err(invalid());
            }

            return Ok(UsageKey {
                course_key: CourseKey {
                    org: parts[0].to_owned(),
                    course: parts[1].to_owned(),
                    run: parts[2].to_owned(),
                    deprecated: false,
                },
                block_type: block_type.to_owned(),
                block_id: block_id.to_owned(),
            });
        }

        if let Some(rest) = s.strip_prefix(DEPRECATED_USAGE_PREFIX) {
            let parts: Vec<&str> = rest.split('/').collect();
            if !valid_parts::<4>(&parts) {
                return Err(invalid());
            }

            return Ok(UsageKey {
                course_key: CourseKey {
                    org: parts[0].to_owned(),
                    course: parts[1].to_owned(),
                    // Deprecated usage ids do not carry the run
                    run: String::new(),
                    deprecated: true,
                },
                block_type: parts[2].to_owned(),
                block_id: parts[3].to_owned(),
            });
        }

        Err(invalid())
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.course_key.deprecated {
            write!(
                f,
                "{}{}/{}/{}/{}",
                DEPRECATED_USAGE_PREFIX,
                self.course_key.org,
                self.course_key.course,
                self.block_type,
                self.block_id
            )
        } else {
            write!(
                f,
                "{}{}+{}+{}+type@{}+block@{}",
                BLOCK_PREFIX,
                self.course_key.org,
                self.course_key.course,
                self.course_key.run,
                self.block_type,
                self.block_id
            )
        }
    }
}
