use serde::{Deserialize, Serialize};

/// Installation status persisted on the `PACKAGE` row.
///
/// The numeric order matters: `Updateable > Installed > NotInstalled`, and
/// the "installed" search filter matches everything `>= Installed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum PackageStatus {
    NotInstalled,
    Installed,
    Updateable,
}

impl PackageStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::NotInstalled => 0,
            Self::Installed => 1,
            Self::Updateable => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Installed,
            2 => Self::Updateable,
            _ => Self::NotInstalled,
        }
    }
}

/// Typed links of a package. The key (`rel`) is not unique; hrefs of one
/// `rel` keep their insertion order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Links {
    entries: Vec<(String, String)>,
}

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rel: impl Into<String>, href: impl Into<String>) {
        self.entries.push((rel.into(), href.into()));
    }

    pub fn hrefs(&self, rel: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(r, _)| r == rel)
            .map(|(_, href)| href.as_str())
            .collect()
    }

    /// Distinct relations in sorted order.
    pub fn rels(&self) -> Vec<&str> {
        let mut rels: Vec<&str> = self.entries.iter().map(|(r, _)| r.as_str()).collect();
        rels.sort_unstable();
        rels.dedup();
        rels
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(r, h)| (r.as_str(), h.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A named software product with a stable reverse-DNS identity.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// Reverse-DNS name, e.g. `com.example.Foo`.
    pub name: String,
    pub title: String,
    pub url: String,
    pub icon: String,
    pub description: String,
    /// Name of the license, referencing the `LICENSE` table.
    pub license: String,
    /// Slash-separated category paths; only the first is materialized.
    pub categories: Vec<String>,
    pub links: Links,
    pub status: PackageStatus,
}

impl Package {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            url: String::new(),
            icon: String::new(),
            description: String::new(),
            license: String::new(),
            categories: Vec::new(),
            links: Links::new(),
            status: PackageStatus::NotInstalled,
        }
    }

    /// Last dotted segment of the name, used to disambiguate user input.
    pub fn short_name(&self) -> &str {
        match self.name.rfind('.') {
            Some(i) => &self.name[i + 1..],
            None => &self.name,
        }
    }

    /// The derived blob the free-text search runs over.
    pub fn full_text(&self) -> String {
        format!("{} {} {}", self.title, self.description, self.name).to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_is_the_last_dotted_segment() {
        assert_eq!(Package::new("com.example.Foo", "Foo").short_name(), "Foo");
        assert_eq!(Package::new("Standalone", "S").short_name(), "Standalone");
    }

    #[test]
    fn links_keep_insertion_order_per_relation() {
        let mut links = Links::new();
        links.add("homepage", "h1");
        links.add("screenshot", "s1");
        links.add("homepage", "h2");

        assert_eq!(links.hrefs("homepage"), vec!["h1", "h2"]);
        assert_eq!(links.rels(), vec!["homepage", "screenshot"]);
    }

    #[test]
    fn status_order_tracks_the_numeric_encoding() {
        assert!(PackageStatus::Updateable > PackageStatus::Installed);
        assert!(PackageStatus::Installed > PackageStatus::NotInstalled);
        assert_eq!(PackageStatus::from_i64(2), PackageStatus::Updateable);
    }
}
