use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub name: String,
    pub title: String,
    pub description: String,
    pub url: String,
}

impl License {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            description: String::new(),
            url: String::new(),
        }
    }
}
