use serde::{Deserialize, Serialize};

// Typed GitHub payloads used by the release-notes endpoints of the facade.
// Only the fields release-note generation reads are modelled.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub id: u64,
    pub tag_name: String,
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    pub published_at: Option<String>,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comparison {
    pub status: String,
    pub ahead_by: u32,
    pub behind_by: u32,
    pub total_commits: u32,
    #[serde(default)]
    pub commits: Vec<CommitSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitSummary {
    pub sha: String,
    pub commit: CommitDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitDetail {
    pub message: String,
}

impl CommitSummary {
    /// First line of the commit message.
    pub fn title(&self) -> &str {
        self.commit.message.lines().next().unwrap_or("").trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_title_is_first_line() {
        let c: CommitSummary = serde_json::from_value(serde_json::json!({
            "sha": "abc",
            "commit": {"message": "Fix pagination\n\nLonger description"}
        }))
        .unwrap();
        assert_eq!(c.title(), "Fix pagination");
    }

    #[test]
    fn release_tolerates_missing_optional_fields() {
        let r: Release = serde_json::from_value(serde_json::json!({
            "id": 1, "tag_name": "v1.0.0", "name": null, "published_at": null
        }))
        .unwrap();
        assert!(!r.draft);
        assert_eq!(r.html_url, "");
    }
}
