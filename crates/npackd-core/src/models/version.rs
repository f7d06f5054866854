use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A dotted sequence of non-negative integer components, e.g. `1.2.0.4`.
///
/// Trailing zero components carry no meaning: `1.2.0.0` compares equal to
/// `1.2` and both normalize to the same stored form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Version {
    parts: Vec<u32>,
}

impl Version {
    pub fn new(parts: Vec<u32>) -> Option<Self> {
        if parts.is_empty() {
            return None;
        }
        Some(Self { parts })
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let mut parts = Vec::new();
        for component in text.split('.') {
            parts.push(component.parse::<u32>().ok()?);
        }
        Self::new(parts)
    }

    /// Drops trailing zero components, keeping at least one component.
    pub fn normalize(&mut self) {
        while self.parts.len() > 1 && *self.parts.last().unwrap() == 0 {
            self.parts.pop();
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    pub fn parts(&self) -> &[u32] {
        &self.parts
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let n = self.parts.len().max(other.parts.len());
        for i in 0..n {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut end = self.parts.len();
        while end > 1 && self.parts[end - 1] == 0 {
            end -= 1;
        }
        self.parts[..end].hash(state);
    }
}
