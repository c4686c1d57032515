//! Turns one manifest entry into one [`DocumentRecord`].
//!
//! Nothing here returns an error to the caller: retrieval and extraction
//! failures become a [`DocumentOutcome`] whose result is `Err`, which maps to
//! an invalid record with the same schema as a valid one.

use log::{debug, warn};

use crate::{
    archive::MemberSource,
    error::DocumentFailure,
    jats::{ArticleFields, FieldExtractor, Reference},
    record::{processing_timestamp, DocumentRecord},
};

#[derive(Debug)]
pub struct ParsedDocument {
    pub fields: ArticleFields,
    pub citations: String,
}

#[derive(Debug)]
pub struct DocumentOutcome {
    pub member: String,
    /// Taken once the outcome is final, after the last step attempted.
    pub processing_date: String,
    pub result: Result<ParsedDocument, DocumentFailure>,
}

impl DocumentOutcome {
    pub fn is_valid(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_record(self) -> DocumentRecord {
        match self.result {
            Ok(ParsedDocument { fields, citations }) => DocumentRecord {
                valid: true,
                title: fields.title,
                abstract_text: fields.abstract_text,
                citations,
                pmid: fields.pmid,
                pmc: fields.pmc,
                doi: fields.doi,
                journal: fields.journal,
                processing_date: self.processing_date,
            },
            Err(_) => DocumentRecord::invalid(self.processing_date),
        }
    }
}

pub fn extract_document<S, E>(source: &S, extractor: &E, member: &str) -> DocumentOutcome
where
    S: MemberSource + ?Sized,
    E: FieldExtractor + ?Sized,
{
    let result = parse_member(source, extractor, member);
    let outcome = DocumentOutcome {
        member: member.to_string(),
        processing_date: processing_timestamp(),
        result,
    };
    match &outcome.result {
        Ok(_) => debug!("Extracted {}", outcome.member),
        Err(e) => warn!("Error while processing {}: {}", outcome.member, e),
    }
    outcome
}

fn parse_member<S, E>(
    source: &S,
    extractor: &E,
    member: &str,
) -> Result<ParsedDocument, DocumentFailure>
where
    S: MemberSource + ?Sized,
    E: FieldExtractor + ?Sized,
{
    let bytes = source.read_member(member)?;
    let fields = extractor.extract(&bytes)?;
    if fields.title.as_deref().map_or(true, str::is_empty) {
        return Err(DocumentFailure::MissingField("title"));
    }
    if fields.abstract_text.as_deref().map_or(true, str::is_empty) {
        return Err(DocumentFailure::MissingField("abstract"));
    }
    let citations = flatten_citations(&fields.references)?;
    Ok(ParsedDocument { fields, citations })
}

/// Joins cited PMIDs with commas, normalising each as an integer.
pub fn flatten_citations(references: &[Reference]) -> Result<String, DocumentFailure> {
    let mut pmids = Vec::new();
    for reference in references {
        let Some(pmid) = reference
            .pmid
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        else {
            debug!(
                "Reference {} has no PMID (doi: {})",
                reference.id.as_deref().unwrap_or("?"),
                reference.doi.as_deref().unwrap_or("none")
            );
            continue;
        };
        let value: u64 = pmid
            .parse()
            .map_err(|_| DocumentFailure::InvalidCitation(pmid.to_string()))?;
        pmids.push(value.to_string());
    }
    Ok(pmids.join(","))
}
