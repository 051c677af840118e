//! Page-aware overlapping chunker.
//!
//! Works on whitespace tokens. Each chunk holds at most `target` tokens and
//! starts `overlap` tokens before the previous one ended, so dropping the
//! first `overlap` tokens of every chunk after the first and joining the rest
//! rebuilds the whitespace-normalized source.

use regex::Regex;

use crate::models::ChunkDraft;

#[derive(Debug, Clone)]
pub struct PageText {
    pub page_number: Option<i64>,
    pub text: String,
}

impl PageText {
    pub fn new(page_number: i64, text: impl Into<String>) -> Self {
        Self {
            page_number: Some(page_number),
            text: text.into(),
        }
    }
}

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "maintenance",
        &[
            "oil", "filter", "fluid", "tire", "brake", "coolant", "transmission",
            "maintenance", "service", "interval", "schedule", "inspect", "replace",
            "lubrication", "rotation", "alignment", "battery", "wiper", "belt",
            "differential", "transfer case", "spark plug", "air filter", "cabin filter",
        ],
    ),
    (
        "technical",
        &[
            "engine", "horsepower", "torque", "specification", "capacity", "dimension",
            "towing", "payload", "electrical", "fuse", "wiring", "sensor", "ecu",
            "transmission", "drivetrain", "suspension", "steering", "exhaust",
            "compression", "displacement", "rpm", "voltage", "amperage", "cylinder",
        ],
    ),
    (
        "safety",
        &[
            "warning", "danger", "caution", "airbag", "seatbelt", "abs", "traction",
            "stability", "brake", "emergency", "hazard", "recall", "safety",
            "collision", "impact", "restraint", "child seat", "latch", "anchor",
        ],
    ),
    (
        "operation",
        &[
            "drive", "start", "stop", "park", "shift", "accelerate", "steering",
            "control", "switch", "button", "dial", "display", "meter", "gauge",
            "indicator", "light", "signal", "horn", "mirror", "seat", "window",
        ],
    ),
    (
        "features",
        &[
            "navigation", "audio", "bluetooth", "climate", "cruise", "4wd", "awd",
            "crawl control", "multi-terrain", "kinetic", "locking", "feature",
            "system", "mode", "setting", "option", "comfort", "convenience",
        ],
    ),
];

/// Lines scanned from the top of a page when looking for headings.
const HEADING_SCAN_LINES: usize = 10;

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    page: usize,
    ends_paragraph: bool,
}

#[derive(Debug, Clone, Default)]
struct PageLabels {
    chapter: Option<String>,
    section: Option<String>,
}

pub struct Chunker {
    target: usize,
    overlap: usize,
    chapter_patterns: Vec<Regex>,
    title_case: Option<Regex>,
}

impl Chunker {
    pub fn new(target_tokens: usize, overlap_tokens: usize) -> Self {
        let target = target_tokens.max(2);
        let overlap = overlap_tokens.min(target - 1);

        let chapter_patterns = [
            r"^(\d{1,2}(?:[-–]\d{1,2})?)\s*[-–]?\s+([A-Z][^.]{2,80})$",
            r"(?i)^(section\s+\d+)\s*[-–:]?\s*(.+)$",
            r"(?i)^(chapter\s+\d+)\s*[-–:]?\s*(.+)$",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect();

        Self {
            target,
            overlap,
            chapter_patterns,
            title_case: Regex::new(r"^[A-Z][a-z]+ [A-Z][a-z]+").ok(),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn chunk_pages(&self, pages: &[PageText]) -> Vec<ChunkDraft> {
        let labels = self.page_labels(pages);
        let tokens = tokenize(pages);
        let n = tokens.len();
        if n == 0 {
            return vec![];
        }

        let min_end_offset = (self.target / 2).max(self.overlap + 1);
        let mut chunks = Vec::new();
        let mut start = 0usize;

        loop {
            let hard_end = (start + self.target).min(n);
            let mut end = hard_end;

            if hard_end < n {
                let lower = start + min_end_offset;
                if let Some(boundary) = (lower..=hard_end)
                    .rev()
                    .find(|&p| tokens[p - 1].ends_paragraph)
                {
                    end = boundary;
                }
            }

            let window = &tokens[start..end];
            let first_page = window[0].page;
            let content = window
                .iter()
                .map(|token| token.text)
                .collect::<Vec<_>>()
                .join(" ");

            chunks.push(ChunkDraft {
                chunk_index: chunks.len() as i64,
                topics: detect_topics(&content),
                content,
                page_number: pages[first_page].page_number,
                token_count: window.len() as i64,
                chapter: labels[first_page].chapter.clone(),
                section: labels[first_page].section.clone(),
            });

            if end == n {
                break;
            }
            start = end - self.overlap;
        }

        chunks
    }

    /// Chapters carry over to later pages until a new heading appears; sections do not.
    fn page_labels(&self, pages: &[PageText]) -> Vec<PageLabels> {
        let mut current_chapter: Option<String> = None;
        pages
            .iter()
            .map(|page| {
                let (chapter, section) = self.extract_headings(&page.text);
                if chapter.is_some() {
                    current_chapter = chapter;
                }
                PageLabels {
                    chapter: current_chapter.clone(),
                    section,
                }
            })
            .collect()
    }

    fn extract_headings(&self, text: &str) -> (Option<String>, Option<String>) {
        let mut chapter = None;
        let mut section = None;

        for line in text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .take(HEADING_SCAN_LINES)
        {
            if chapter.is_none() {
                chapter = self.chapter_patterns.iter().find_map(|re| {
                    re.captures(line).map(|caps| {
                        format!("{} - {}", caps[1].trim(), caps[2].trim())
                    })
                });
            }

            let len = line.chars().count();
            if section.is_none() && len > 5 && len < 100 {
                if is_all_caps(line) {
                    section = Some(title_case(line));
                } else if self
                    .title_case
                    .as_ref()
                    .is_some_and(|re| re.is_match(line))
                {
                    section = Some(line.to_string());
                }
            }
        }

        (chapter, section)
    }
}

fn tokenize(pages: &[PageText]) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    for (page_idx, page) in pages.iter().enumerate() {
        for paragraph in split_paragraphs(&page.text) {
            let para_start = tokens.len();
            tokens.extend(paragraph.split_whitespace().map(|text| Token {
                text,
                page: page_idx,
                ends_paragraph: false,
            }));
            if tokens.len() > para_start {
                if let Some(last) = tokens.last_mut() {
                    last.ends_paragraph = true;
                }
            }
        }
    }
    tokens
}

fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut start = 0usize;
    let mut offset = 0usize;
    let mut blank_run = false;

    for line in text.split_inclusive('\n') {
        let is_blank = line.trim().is_empty();
        if is_blank && !blank_run {
            paragraphs.push(&text[start..offset]);
        }
        if !is_blank && blank_run {
            start = offset;
        }
        blank_run = is_blank;
        offset += line.len();
    }
    if !blank_run {
        paragraphs.push(&text[start..]);
    }

    paragraphs
}

fn is_all_caps(line: &str) -> bool {
    line.chars().any(|c| c.is_alphabetic())
        && !line.chars().any(|c| c.is_lowercase())
}

fn title_case(line: &str) -> String {
    line.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn detect_topics(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let topics: Vec<String> = TOPIC_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().filter(|kw| lower.contains(*kw)).count() >= 2)
        .map(|(topic, _)| topic.to_string())
        .collect();

    if topics.is_empty() {
        vec!["general".to_string()]
    } else {
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(prefix: &str, count: usize) -> String {
        (1..=count)
            .map(|n| format!("{prefix}{n}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn rebuild(chunks: &[ChunkDraft], overlap: usize) -> String {
        let mut tokens: Vec<&str> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let skip = if i == 0 { 0 } else { overlap };
            tokens.extend(chunk.content.split_whitespace().skip(skip));
        }
        tokens.join(" ")
    }

    #[test]
    fn three_page_document_yields_five_chunks_with_first_token_pages() {
        let pages = vec![
            PageText::new(1, words("a", 25)),
            PageText::new(2, words("b", 25)),
            PageText::new(3, words("c", 55)),
        ];

        let chunks = Chunker::new(30, 5).chunk_pages(&pages);

        assert_eq!(chunks.len(), 5);
        let page_numbers: Vec<_> = chunks.iter().map(|c| c.page_number).collect();
        assert_eq!(
            page_numbers,
            vec![Some(1), Some(1), Some(2), Some(3), Some(3)]
        );
        assert_eq!(
            chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        // The first chunk stops at the page-1 paragraph end instead of running to 30.
        assert_eq!(chunks[0].token_count, 25);
    }

    #[test]
    fn concatenation_without_overlap_reproduces_source() {
        let pages = vec![
            PageText::new(1, format!("{}\n\n{}", words("x", 40), words("y", 12))),
            PageText::new(2, String::new()),
            PageText::new(3, format!("  {}  \n{}", words("z", 90), words("w", 7))),
        ];
        let chunker = Chunker::new(32, 6);
        let chunks = chunker.chunk_pages(&pages);

        let expected = pages
            .iter()
            .flat_map(|p| p.text.split_whitespace())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rebuild(&chunks, chunker.overlap()), expected);
        assert!(chunks.iter().all(|c| c.token_count as usize <= 32));
    }

    #[test]
    fn consecutive_chunks_share_exactly_the_overlap() {
        let pages = vec![PageText::new(1, words("t", 200))];
        let chunks = Chunker::new(50, 10).chunk_pages(&pages);

        for pair in chunks.windows(2) {
            let prev: Vec<_> = pair[0].content.split_whitespace().collect();
            let next: Vec<_> = pair[1].content.split_whitespace().collect();
            assert_eq!(&prev[prev.len() - 10..], &next[..10]);
        }
    }

    #[test]
    fn long_single_paragraph_is_hard_split() {
        let pages = vec![PageText::new(7, words("p", 75))];
        let chunks = Chunker::new(30, 0).chunk_pages(&pages);
        assert_eq!(
            chunks.iter().map(|c| c.token_count).collect::<Vec<_>>(),
            vec![30, 30, 15]
        );
        assert!(chunks.iter().all(|c| c.page_number == Some(7)));
    }

    #[test]
    fn empty_input_produces_no_chunks() {
        let pages = vec![PageText::new(1, "   \n\n  "), PageText::new(2, "")];
        assert!(Chunker::new(30, 5).chunk_pages(&pages).is_empty());
    }

    #[test]
    fn chapter_sticks_across_pages_and_sections_are_per_page() {
        let pages = vec![
            PageText::new(1, "1-1 Before Driving\nBRAKE SYSTEM\nCheck the brake fluid."),
            PageText::new(2, "continued text about the pedal feel and travel"),
        ];
        let chunks = Chunker::new(8, 2).chunk_pages(&pages);

        assert_eq!(chunks[0].chapter.as_deref(), Some("1-1 - Before Driving"));
        assert_eq!(chunks[0].section.as_deref(), Some("Brake System"));
        let last = chunks.last().unwrap();
        assert_eq!(last.page_number, Some(2));
        assert_eq!(last.chapter.as_deref(), Some("1-1 - Before Driving"));
        assert_eq!(last.section, None);
    }

    #[test]
    fn topics_need_two_keyword_hits() {
        assert_eq!(
            detect_topics("Replace the oil filter at every service interval."),
            vec!["maintenance".to_string()]
        );
        assert_eq!(detect_topics("A single brake."), vec!["general".to_string()]);
    }

    #[test]
    fn overlap_is_clamped_below_target() {
        let chunker = Chunker::new(10, 50);
        assert_eq!(chunker.overlap(), 9);
        let chunks = chunker.chunk_pages(&[PageText::new(1, words("q", 40))]);
        assert!(!chunks.is_empty());
        assert_eq!(chunks.last().unwrap().content.split_whitespace().last(), Some("q40"));
    }
}
