//! Streaming extraction of bibliographic fields from PMC JATS articles.
//!
//! Only the front matter (journal and article metadata, abstract) and the
//! reference list are read; everything else is skipped without allocation
//! beyond the event buffer.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;

use crate::error::ExtractionError;

type XmlReader<'a> = Reader<&'a [u8]>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleFields {
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub journal: Option<String>,
    pub doi: Option<String>,
    pub pmid: Option<String>,
    pub pmc: Option<String>,
    pub references: Vec<Reference>,
}

/// One `<ref>` entry of the article's reference list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reference {
    pub id: Option<String>,
    pub pmid: Option<String>,
    pub doi: Option<String>,
}

/// The field-extraction capability the pipeline depends on.
pub trait FieldExtractor: Sync {
    fn extract(&self, xml: &[u8]) -> Result<ArticleFields, ExtractionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JatsExtractor;

impl FieldExtractor for JatsExtractor {
    fn extract(&self, xml: &[u8]) -> Result<ArticleFields, ExtractionError> {
        parse_article(xml)
    }
}

#[derive(Debug, Default)]
struct ArticleIds {
    pmid: Option<String>,
    pmc: Option<String>,
    pmcid: Option<String>,
    doi: Option<String>,
}

#[derive(Debug, Default)]
struct JournalNames {
    title: Option<String>,
    nlm_ta: Option<String>,
    iso_abbrev: Option<String>,
}

pub fn parse_article(xml: &[u8]) -> Result<ArticleFields, ExtractionError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().expand_empty_elements = true;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = std::str::from_utf8(e.name().as_ref())?.to_string();
                if name != "article" {
                    return Err(ExtractionError::NotAnArticle(name));
                }
                break;
            }
            Event::Eof => return Err(ExtractionError::EmptyDocument),
            _ => {}
        }
        buf.clear();
    }

    let mut fields = ArticleFields::default();
    let mut ids = ArticleIds::default();
    let mut journal = JournalNames::default();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"front" => parse_front(&mut reader, &mut fields, &mut ids, &mut journal)?,
                b"back" => parse_back(&mut reader, &mut fields.references)?,
                _ => skip_element(&mut reader)?,
            },
            Event::End(e) if e.name().as_ref() == b"article" => break,
            Event::Eof => break,
            _ => {}
        }
    }

    fields.pmid = ids.pmid;
    fields.pmc = ids.pmc.or(ids.pmcid);
    fields.doi = ids.doi;
    fields.journal = journal.title.or(journal.nlm_ta).or(journal.iso_abbrev);
    Ok(fields)
}

fn parse_front(
    reader: &mut XmlReader,
    fields: &mut ArticleFields,
    ids: &mut ArticleIds,
    journal: &mut JournalNames,
) -> Result<(), ExtractionError> {
    let mut buf = Vec::new();
    let mut depth = 1;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"journal-meta" => parse_journal_meta(reader, journal)?,
                b"article-meta" => parse_article_meta(reader, fields, ids)?,
                _ => depth += 1,
            },
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_journal_meta(
    reader: &mut XmlReader,
    journal: &mut JournalNames,
) -> Result<(), ExtractionError> {
    let mut buf = Vec::new();
    let mut depth = 1;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"journal-title" => {
                    let text = read_text_content(reader)?;
                    if journal.title.is_none() {
                        journal.title = text;
                    }
                }
                b"journal-id" => {
                    let id_type = attribute(&e, b"journal-id-type");
                    let text = read_text_content(reader)?;
                    match id_type.as_deref() {
                        Some("nlm-ta") if journal.nlm_ta.is_none() => journal.nlm_ta = text,
                        Some("iso-abbrev") if journal.iso_abbrev.is_none() => {
                            journal.iso_abbrev = text
                        }
                        _ => {}
                    }
                }
                _ => depth += 1,
            },
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_article_meta(
    reader: &mut XmlReader,
    fields: &mut ArticleFields,
    ids: &mut ArticleIds,
) -> Result<(), ExtractionError> {
    let mut buf = Vec::new();
    let mut depth = 1;
    let mut typed_abstract = None;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"article-id" => {
                    let id_type = attribute(&e, b"pub-id-type");
                    let value = read_text_content(reader)?;
                    let slot = match id_type.as_deref() {
                        Some("pmid") => Some(&mut ids.pmid),
                        Some("pmc") => Some(&mut ids.pmc),
                        Some("pmcid") => Some(&mut ids.pmcid),
                        Some("doi") => Some(&mut ids.doi),
                        _ => None,
                    };
                    if let Some(slot) = slot.filter(|slot| slot.is_none()) {
                        *slot = value;
                    }
                }
                b"title-group" => {
                    let title = parse_title_group(reader)?;
                    if fields.title.is_none() {
                        fields.title = title;
                    }
                }
                // Typed abstracts (summaries, teasers) only stand in when
                // the article has no plain one.
                b"abstract" => {
                    let text = parse_abstract(reader)?;
                    if attribute(&e, b"abstract-type").is_none() {
                        if fields.abstract_text.is_none() {
                            fields.abstract_text = text;
                        }
                    } else if typed_abstract.is_none() {
                        typed_abstract = text;
                    }
                }
                _ => skip_element(reader)?,
            },
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if fields.abstract_text.is_none() {
        fields.abstract_text = typed_abstract;
    }
    Ok(())
}

fn parse_title_group(reader: &mut XmlReader) -> Result<Option<String>, ExtractionError> {
    let mut buf = Vec::new();
    let mut title = None;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"article-title" if title.is_none() => title = read_text_content(reader)?,
                _ => skip_element(reader)?,
            },
            Event::End(_) => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(title)
}

fn parse_abstract(reader: &mut XmlReader) -> Result<Option<String>, ExtractionError> {
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut depth = 1;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"title" | b"label" => skip_element(reader)?,
                b"p" => paragraphs.extend(read_text_content(reader)?),
                _ => depth += 1,
            },
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(if paragraphs.is_empty() {
        None
    } else {
        Some(paragraphs.join("\n"))
    })
}

fn parse_back(reader: &mut XmlReader, references: &mut Vec<Reference>) -> Result<(), ExtractionError> {
    let mut buf = Vec::new();
    let mut depth = 1;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"ref" => {
                    let id = attribute(&e, b"id");
                    references.push(parse_ref(reader, id)?);
                }
                _ => depth += 1,
            },
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_ref(reader: &mut XmlReader, id: Option<String>) -> Result<Reference, ExtractionError> {
    let mut reference = Reference {
        id,
        ..Reference::default()
    };
    let mut buf = Vec::new();
    let mut depth = 1;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"pub-id" => {
                    let id_type = attribute(&e, b"pub-id-type");
                    let value = read_text_content(reader)?;
                    match id_type.as_deref() {
                        Some("pmid") if reference.pmid.is_none() => reference.pmid = value,
                        Some("doi") if reference.doi.is_none() => reference.doi = value,
                        _ => {}
                    }
                }
                _ => depth += 1,
            },
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(reference)
}

/// Collects the text of the element just opened, inline markup included, and
/// consumes its end tag. Whitespace runs collapse to one space.
fn read_text_content(reader: &mut XmlReader) -> Result<Option<String>, ExtractionError> {
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut depth = 1;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Text(t) => text.push_str(&unescape_lossy(&t)),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(if collapsed.is_empty() { None } else { Some(collapsed) })
}

fn skip_element(reader: &mut XmlReader) -> Result<(), ExtractionError> {
    let mut buf = Vec::new();
    let mut depth = 1;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

// Entities outside the XML builtins (e.g. `&nbsp;` from HTML-ish sources)
// are kept verbatim instead of failing the document.
fn unescape_lossy(text: &BytesText) -> String {
    match text.unescape() {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}

fn attribute(element: &BytesStart, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .map(|attr| String::from_utf8_lossy(&attr.value).trim().to_string())
}
