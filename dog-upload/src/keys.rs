use crate::UploadId;

const PENDING_DIR: &str = ".pending";

/// Names backend objects for uploads.
///
/// Upload `id` lives at `{prefix}/{id}`; a hidden staged upload keeps its
/// metadata on a marker at `{prefix}/.pending/{id}` until the first commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadKeys {
    prefix: String,
}

/// Which object a listed name refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Object(UploadId),
    Pending(UploadId),
}

impl KeyKind {
    pub fn id(&self) -> &UploadId {
        match self {
            Self::Object(id) | Self::Pending(id) => id,
        }
    }
}

impl UploadKeys {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix passed to backend listings
    pub fn list_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    /// Whether `id` names exactly one upload object.
    ///
    /// Ids are non-empty, carry no path separator and do not start with a
    /// dot, so no id reaches a pending marker or the pending directory.
    pub fn is_valid_id(id: &UploadId) -> bool {
        let id = id.as_str();
        !id.is_empty() && !id.contains('/') && !id.starts_with('.')
    }

    pub fn object_key(&self, id: &UploadId) -> String {
        format!("{}{}", self.list_prefix(), id)
    }

    pub fn pending_key(&self, id: &UploadId) -> String {
        format!("{}{}/{}", self.list_prefix(), PENDING_DIR, id)
    }

    /// Map a listed object name back to its upload.
    ///
    /// Names outside the prefix or nested deeper than the layout allows are
    /// not uploads and yield `None`.
    pub fn parse(&self, name: &str) -> Option<KeyKind> {
        let rest = name.strip_prefix(&self.list_prefix())?;
        let kind = match rest.split_once('/') {
            None => KeyKind::Object(UploadId::from(rest)),
            Some((PENDING_DIR, id)) => KeyKind::Pending(UploadId::from(id)),
            Some(_) => return None,
        };
        Self::is_valid_id(kind.id()).then_some(kind)
    }
}
