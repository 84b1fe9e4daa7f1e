//! Unit extraction: walk an EPUB's spine-ordered content documents and
//! produce the ordered, resumable unit list.
//!
//! Chapter headings are found by a cascade of heuristics tried in priority
//! order, each a pure function. Emphasis markup survives as `*...*`
//! delimiters via a depth-first walk that stops at the first emphasis
//! element, so text is never duplicated and nested emphasis never nests
//! delimiters.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::LazyLock;

use epub::doc::EpubDoc;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::manifest::Unit;
use crate::normalize::{normalize, Mode};

static HEADING_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1, h2, h3").unwrap());
static PARAGRAPH_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p").unwrap());
static BODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p, li, td, th, dd, dt, blockquote").unwrap());
const BODY_TAGS: [&str; 7] = ["p", "li", "td", "th", "dd", "dt", "blockquote"];

static VALID_TEXT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9.]").unwrap());
static CHAPTER_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)chapter\s+\d+").unwrap());
static CONSECUTIVE_LETTERS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z]{2,}").unwrap());

/// Assigns ids in document order; ids are never reused or reordered for the
/// same document version.
struct UnitAssembler {
    counter: usize,
    section_counter: usize,
    units: Vec<Unit>,
}

impl UnitAssembler {
    fn new() -> Self {
        Self { counter: 0, section_counter: 1, units: Vec::new() }
    }

    fn push(&mut self, raw_text: &str, chapter: bool, replacements: &[(String, String)]) {
        self.counter += 1;
        let id = format!("pgrf-{:05}", self.counter);
        self.units.push(Unit::new(
            id,
            normalize(raw_text, Mode::Synthesis, replacements),
            normalize(raw_text, Mode::Display, &[]),
            chapter,
        ));
    }

    fn next_section_title(&mut self) -> String {
        let title = format!("Section {}", self.section_counter);
        self.section_counter += 1;
        title
    }
}

/// Extract the full unit list from an opened EPUB. A malformed or missing
/// resource degrades to zero units for that item; zero document items yield
/// an empty list, not an error.
pub fn extract_units(doc: &mut EpubDoc<BufReader<File>>, config: &Config) -> Vec<Unit> {
    let replacements = config.active_backend().replacements.clone();
    let mut assembler = UnitAssembler::new();
    let spine: Vec<String> = doc.spine.iter().map(|item| item.idref.clone()).collect();

    for idref in &spine {
        match doc.get_resource(idref) {
            Some((content, mime)) if mime.contains("html") => {
                let html = String::from_utf8_lossy(&content);
                units_from_item(&html, &mut assembler, &replacements, config.broad_heading_fallback);
            }
            Some(_) => debug!(idref = %idref, "skipping non-document spine item"),
            None => warn!(idref = %idref, "failed to read spine item, skipping"),
        }
    }

    append_structure(&mut assembler, &spine, &replacements);

    info!(units = assembler.units.len(), "extraction complete");
    assembler.units
}

/// Trailing synthetic section listing the raw content items; useful for
/// navigating a mis-detected book. A book where nothing was extractable
/// stays an empty unit list and gets no trailer.
fn append_structure(
    assembler: &mut UnitAssembler,
    idrefs: &[String],
    replacements: &[(String, String)],
) {
    if assembler.units.is_empty() {
        return;
    }
    assembler.push("Structure", true, replacements);
    for idref in idrefs {
        assembler.push(idref, false, replacements);
    }
}

/// Extract the units contributed by one content document.
fn units_from_item(
    html: &str,
    assembler: &mut UnitAssembler,
    replacements: &[(String, String)],
    broad_fallback: bool,
) {
    let tree = Html::parse_document(html);

    let (heading_text, heading_node) = match find_heading(&tree, broad_fallback) {
        Some((text, node)) => (text, Some(node)),
        None => (assembler.next_section_title(), None),
    };
    assembler.push(&heading_text, true, replacements);

    for element in tree.select(&BODY_SEL) {
        if Some(element.id()) == heading_node {
            continue;
        }
        // A p inside a blockquote (or any nested body tag) is covered by
        // its ancestor's text; emitting both would duplicate it.
        if has_body_ancestor(&element) {
            continue;
        }
        let display = flatten_emphasis(&element);
        let cleaned = normalize(&display, Mode::Synthesis, replacements);
        if !cleaned.is_empty() && is_valid_text(&cleaned) {
            assembler.push(&display, false, replacements);
        }
    }
}

/// Chapter-title cascade: first valid h1/h2/h3, then the paragraph
/// heuristics, then nothing (the caller synthesizes a section title).
/// Returns the title text and the node that supplied it, so the body pass
/// can exclude it.
fn find_heading(tree: &Html, broad_fallback: bool) -> Option<(String, ego_tree::NodeId)> {
    for heading in tree.select(&HEADING_SEL) {
        let text = element_text(&heading);
        if is_valid_text(&text) {
            return Some((text, heading.id()));
        }
    }
    for paragraph in tree.select(&PARAGRAPH_SEL) {
        let text = element_text(&paragraph);
        let marked = class_marks_chapter(&paragraph)
            || text_marks_chapter(&text)
            || (broad_fallback && has_consecutive_letters(&text));
        if marked && !text.is_empty() {
            return Some((text, paragraph.id()));
        }
    }
    None
}

fn element_text(element: &ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Valid spoken text contains at least one alphanumeric or period.
fn is_valid_text(text: &str) -> bool {
    VALID_TEXT.is_match(text)
}

/// CSS class tokens publishers commonly use for chapter openers.
fn class_marks_chapter(element: &ElementRef) -> bool {
    element
        .value()
        .classes()
        .any(|class| matches!(class, "chapter" | "section" | "CT"))
}

/// `chapter <number>` anywhere in the text, case-insensitive. Also used by
/// the duration pass as the chapter-marker promotion token.
pub(crate) fn text_marks_chapter(text: &str) -> bool {
    CHAPTER_NUMBER.is_match(text)
}

fn has_consecutive_letters(text: &str) -> bool {
    CONSECUTIVE_LETTERS.is_match(text)
}

fn has_body_ancestor(element: &ElementRef) -> bool {
    element.ancestors().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|el| BODY_TAGS.contains(&el.name()))
    })
}

/// Flatten an inline tree to plain text, wrapping each outermost emphasis
/// subtree in a single pair of asterisks. Emphasis subtrees are not
/// recursed into, so nested emphasis cannot nest delimiters.
pub(crate) fn flatten_emphasis(element: &ElementRef) -> String {
    let mut out = String::new();
    for child in element.children() {
        visit_inline(child, &mut out);
    }
    out.trim().to_string()
}

fn visit_inline(node: ego_tree::NodeRef<Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(text),
        Node::Element(element) => {
            if is_emphasis(element) {
                let inner = subtree_text(node);
                let inner = inner.trim();
                if !inner.is_empty() {
                    out.push('*');
                    out.push_str(inner);
                    out.push('*');
                }
            } else {
                for child in node.children() {
                    visit_inline(child, out);
                }
            }
        }
        _ => {}
    }
}

fn is_emphasis(element: &scraper::node::Element) -> bool {
    match element.name() {
        "i" | "em" => true,
        "span" => element
            .classes()
            .any(|class| class.to_lowercase().contains("italic")),
        _ => false,
    }
}

fn subtree_text(node: ego_tree::NodeRef<Node>) -> String {
    let mut text = String::new();
    for descendant in node.descendants() {
        if let Node::Text(t) = descendant.value() {
            text.push_str(t);
        }
    }
    text
}

/// Pull the cover image out of the EPUB, preferring the declared cover,
/// then any image item whose id mentions "cover", then the first image.
pub fn save_cover(doc: &mut EpubDoc<BufReader<File>>, output_dir: &Path) -> std::io::Result<bool> {
    let cover = doc.get_cover().map(|(bytes, _mime)| bytes).or_else(|| {
        let mut images: Vec<(String, String)> = doc
            .resources
            .iter()
            .filter(|(_, item)| item.mime.starts_with("image/"))
            .map(|(id, _)| (id.clone(), id.to_lowercase()))
            .collect();
        images.sort();
        images
            .iter()
            .find(|(_, lower)| lower.contains("cover"))
            .or_else(|| images.first())
            .and_then(|(id, _)| doc.get_resource(id))
            .map(|(bytes, _mime)| bytes)
    });

    match cover {
        Some(bytes) => {
            fs::write(output_dir.join("cover.jpg"), bytes)?;
            info!("saved cover image");
            Ok(true)
        }
        None => {
            warn!("no cover image found");
            Ok(false)
        }
    }
}
