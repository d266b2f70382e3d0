//! `multipart/form-data` bodies (RFC 7578) for `Crawler::post_multipart`.
//!
//! # Example
//!
//! ```
//! use predator::MultipartForm;
//!
//! let form = MultipartForm::new()
//!     .text("title", "report")
//!     .file("upload", "data.csv", "text/csv", b"a,b\n1,2\n".to_vec());
//! assert!(form.content_type().starts_with("multipart/form-data; boundary="));
//! assert_eq!(form.text_fields().get("title").map(String::as_str), Some("report"));
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;

use rand::Rng;

/// Hyphens preceding the random boundary tail by default.
pub const DEFAULT_BOUNDARY_DASHES: usize = 27;

/// Digits in the random boundary tail.
const BOUNDARY_DIGITS: usize = 29;

#[derive(Debug, Clone)]
enum Part {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        content_type: String,
        data: Vec<u8>,
    },
}

/// Builder for a multipart form body.
#[derive(Debug, Clone)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    /// Creates an empty form with a generated boundary.
    #[must_use]
    pub fn new() -> Self {
        Self::with_dashes(DEFAULT_BOUNDARY_DASHES)
    }

    /// Creates an empty form whose generated boundary starts with `dashes` hyphens.
    #[must_use]
    pub fn with_dashes(dashes: usize) -> Self {
        Self {
            boundary: random_boundary(dashes),
            parts: Vec::new(),
        }
    }

    /// Replaces the boundary with a caller-supplied one.
    #[must_use]
    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    /// Adds a text field.
    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Adds a file part.
    #[must_use]
    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.parts.push(Part::File {
            name: name.into(),
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        });
        self
    }

    /// The boundary string.
    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` header value for this body.
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Text fields by name; the last value wins for repeated names.
    #[must_use]
    pub fn text_fields(&self) -> BTreeMap<String, String> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { name, value } => Some((name.clone(), value.clone())),
                Part::File { .. } => None,
            })
            .collect()
    }

    /// Encodes the form.
    #[must_use]
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for part in &self.parts {
            let mut head = format!("--{}\r\n", self.boundary);
            match part {
                Part::Text { name, value } => {
                    let _ = write!(
                        head,
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        escape_quotes(name)
                    );
                    body.extend_from_slice(head.as_bytes());
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File {
                    name,
                    filename,
                    content_type,
                    data,
                } => {
                    let _ = write!(
                        head,
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {content_type}\r\n\r\n",
                        escape_quotes(name),
                        escape_quotes(filename)
                    );
                    body.extend_from_slice(head.as_bytes());
                    body.extend_from_slice(data);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        body
    }
}

fn random_boundary(dashes: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut boundary = "-".repeat(dashes);
    boundary.extend((0..BOUNDARY_DIGITS).map(|_| char::from(b'0' + rng.gen_range(0..10u8))));
    boundary
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "%22")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_boundary_shape() {
        let form = MultipartForm::new();
        let (dashes, digits) = form.boundary().split_at(DEFAULT_BOUNDARY_DASHES);
        assert!(dashes.chars().all(|c| c == '-'));
        assert_eq!(digits.len(), BOUNDARY_DIGITS);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));

        let custom = MultipartForm::with_dashes(4);
        assert_eq!(custom.boundary().len(), 4 + BOUNDARY_DIGITS);
        assert!(custom.boundary().starts_with("----"));
        assert_ne!(&custom.boundary()[4..5], "-");
    }

    #[test]
    fn test_body_layout() {
        let form = MultipartForm::new()
            .with_boundary("XyZ")
            .text("name", "tom")
            .file("f", "a.txt", "text/plain", b"hi".to_vec());
        let body = String::from_utf8(form.to_body()).unwrap();
        assert_eq!(
            body,
            "--XyZ\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\ntom\r\n\
             --XyZ\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nhi\r\n--XyZ--\r\n"
        );
        assert_eq!(form.content_type(), "multipart/form-data; boundary=XyZ");
    }

    #[test]
    fn test_text_fields_skip_files() {
        let form = MultipartForm::new()
            .text("a", "1")
            .file("b", "b.bin", "application/octet-stream", vec![0, 1]);
        let fields = form.text_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["a"], "1");
    }

    #[test]
    fn test_empty_form_is_just_terminator() {
        let form = MultipartForm::new().with_boundary("b");
        assert_eq!(form.to_body(), b"--b--\r\n");
    }
}
