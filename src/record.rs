use time::{macros::format_description, OffsetDateTime};

/// One output row. Every manifest entry produces exactly one of these.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentRecord {
    pub valid: bool,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    /// Cited PMIDs, comma separated.
    pub citations: String,
    pub pmid: Option<String>,
    pub pmc: Option<String>,
    pub doi: Option<String>,
    pub journal: Option<String>,
    pub processing_date: String,
}

impl DocumentRecord {
    pub fn invalid(processing_date: String) -> Self {
        Self {
            processing_date,
            ..Self::default()
        }
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn processing_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
        ))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_fixed_width_and_sortable() {
        let stamp = processing_timestamp();
        assert_eq!(stamp.len(), "2024-01-01T00:00:00Z".len());
        assert!(stamp.ends_with('Z'));
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[10..11], "T");
    }

    #[test]
    fn invalid_record_carries_only_the_timestamp() {
        let record = DocumentRecord::invalid("2024-01-01T00:00:00Z".into());
        assert!(!record.valid);
        assert!(record.title.is_none() && record.abstract_text.is_none());
        assert!(record.citations.is_empty());
        assert_eq!(record.processing_date, "2024-01-01T00:00:00Z");
    }
}
