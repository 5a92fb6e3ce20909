use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A labeled section of a parsed résumé, as produced by document ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSection {
    pub label: String,
    #[serde(default)]
    pub text: String,
    /// List-shaped sections (skills, certifications) arrive as items.
    #[serde(default)]
    pub items: Vec<String>,
}

impl DocumentSection {
    /// Section body: free text followed by the comma-joined item list.
    pub fn body(&self) -> String {
        let text = self.text.trim();
        let items: Vec<&str> = self
            .items
            .iter()
            .map(|i| i.trim())
            .filter(|i| !i.is_empty())
            .collect();
        match (text.is_empty(), items.is_empty()) {
            (_, true) => text.to_string(),
            (true, false) => items.join(", "),
            (false, false) => format!("{text}\n{}", items.join(", ")),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.body().trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub document_id: Uuid,
    pub sections: Vec<DocumentSection>,
}

impl StructuredDocument {
    pub fn has_content(&self) -> bool {
        self.sections.iter().any(|s| !s.is_blank())
    }
}
