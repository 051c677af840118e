use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use regex::Regex;
use reqwest::Url;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use walkdir::WalkDir;

use crate::ingest::pdf::has_command;
use crate::models::{DocumentChunk, SourceReference};

const THUMBNAIL_WIDTH: u32 = 300;
const FULLSIZE_WIDTH: u32 = 1200;
const MAX_KEY_TERMS: usize = 10;
const MAX_SLUG_STEM: usize = 80;
const HIGHLIGHT_COLOR: [u8; 3] = [255, 230, 0];
const HIGHLIGHT_ALPHA: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageVariant {
    Thumbnail,
    Full,
    Highlighted,
}

impl ImageVariant {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "thumbnail" => Some(ImageVariant::Thumbnail),
            "full" => Some(ImageVariant::Full),
            "highlighted" => Some(ImageVariant::Highlighted),
            _ => None,
        }
    }
}

/// A word's box on the page, in PDF points from the top-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct WordBox {
    pub text: String,
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageLayout {
    pub width: f32,
    pub height: f32,
    pub words: Vec<WordBox>,
}

/// Rendered page PNGs under `<data_dir>/page_images/{thumbnails,fullsize,highlighted}`.
#[derive(Clone)]
pub struct PageImages {
    root: PathBuf,
}

impl PageImages {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File-system and URL safe key of a document name: the sanitized stem
    /// plus a short digest of the full name, so distinct names never share images.
    pub fn slug(document_name: &str) -> String {
        let stem = Path::new(document_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(document_name);
        let safe: String = stem
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .take(MAX_SLUG_STEM)
            .collect();
        let digest = Sha256::digest(document_name.as_bytes());
        format!("{safe}_{}", hex_prefix(&digest, 8))
    }

    fn is_safe_slug(slug: &str) -> bool {
        !slug.is_empty()
            && slug.len() <= MAX_SLUG_STEM * 4 + 9
            && slug.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    }

    pub fn thumbnail_path(&self, document_name: &str, page: i64) -> PathBuf {
        self.root
            .join("thumbnails")
            .join(format!("{}_page_{page}.png", Self::slug(document_name)))
    }

    pub fn fullsize_path(&self, document_name: &str, page: i64) -> PathBuf {
        self.root
            .join("fullsize")
            .join(format!("{}_page_{page}.png", Self::slug(document_name)))
    }

    /// Rendered image behind a `/api/pages/:slug/:page/:variant` request.
    /// The highlighted variant's base is the full-size render.
    pub fn variant_path(&self, slug: &str, page: i64, variant: ImageVariant) -> Option<PathBuf> {
        if !Self::is_safe_slug(slug) {
            return None;
        }
        let dir = match variant {
            ImageVariant::Thumbnail => "thumbnails",
            ImageVariant::Full | ImageVariant::Highlighted => "fullsize",
        };
        let path = self.root.join(dir).join(format!("{slug}_page_{page}.png"));
        path.is_file().then_some(path)
    }

    /// Full-size render with every occurrence of `terms` painted over.
    /// Results are cached per term set. Falls back to the plain render when
    /// there is nothing to mark or the layout tool is not installed.
    pub async fn highlighted(
        &self,
        slug: &str,
        page: i64,
        pdf_path: &Path,
        terms: &[String],
    ) -> Result<Option<PathBuf>> {
        let Some(full) = self.variant_path(slug, page, ImageVariant::Full) else {
            return Ok(None);
        };
        let terms: Vec<String> = terms
            .iter()
            .map(|term| term.trim().to_string())
            .filter(|term| !term.is_empty())
            .collect();
        if terms.is_empty() {
            return Ok(Some(full));
        }

        let cached = self
            .root
            .join("highlighted")
            .join(format!("{slug}_page_{page}_{}.png", terms_key(&terms)));
        if cached.is_file() {
            return Ok(Some(cached));
        }

        if !has_command("pdftotext").await {
            tracing::warn!(slug, page, "pdftotext not found; serving page without highlights");
            return Ok(Some(full));
        }
        let layout = page_layout(pdf_path, page).await?;
        let boxes = match_terms(&layout, &terms);
        if boxes.is_empty() {
            return Ok(Some(full));
        }

        tokio::fs::create_dir_all(self.root.join("highlighted")).await?;
        let out = cached.clone();
        let painted = boxes.len();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut img = image::open(&full)
                .with_context(|| format!("failed decoding {}", full.display()))?
                .to_rgba8();
            let scale_x = img.width() as f32 / layout.width.max(1.0);
            let scale_y = img.height() as f32 / layout.height.max(1.0);
            paint_highlights(&mut img, &boxes, scale_x, scale_y);
            img.save(&out)
                .with_context(|| format!("failed writing {}", out.display()))
        })
        .await
        .context("highlight task panicked")??;

        tracing::debug!(slug, page, painted, "rendered highlighted page");
        Ok(Some(cached))
    }

    /// Renders every page at two widths with poppler's `pdftoppm`. Returns
    /// the number of pages rendered; zero when the renderer is not installed.
    pub async fn render(&self, pdf_path: &Path, document_name: &str, page_count: usize) -> Result<usize> {
        if !has_command("pdftoppm").await {
            tracing::warn!(document = document_name, "pdftoppm not found; skipping page images");
            return Ok(0);
        }

        tokio::fs::create_dir_all(self.root.join("thumbnails")).await?;
        tokio::fs::create_dir_all(self.root.join("fullsize")).await?;

        let mut rendered = 0;
        for page in 1..=page_count as i64 {
            let thumb = self.thumbnail_path(document_name, page);
            let full = self.fullsize_path(document_name, page);
            let ok = render_page(pdf_path, page, THUMBNAIL_WIDTH, &thumb).await?
                && render_page(pdf_path, page, FULLSIZE_WIDTH, &full).await?;
            if ok {
                rendered += 1;
            }
        }

        Ok(rendered)
    }

    /// Deletes this document's renders and highlight cache, nothing else.
    pub async fn remove(&self, document_name: &str) -> Result<usize> {
        let prefix = format!("{}_page_", Self::slug(document_name));
        let files: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix(&prefix))
                    .and_then(|rest| rest.strip_suffix(".png"))
                    .is_some_and(is_page_suffix)
            })
            .map(|entry| entry.path().to_path_buf())
            .collect();

        for file in &files {
            tokio::fs::remove_file(file)
                .await
                .with_context(|| format!("failed removing page image {}", file.display()))?;
        }
        Ok(files.len())
    }

    /// Citation for a hit. Image locators are omitted when the page was
    /// never rendered.
    pub fn resolve(&self, chunk: &DocumentChunk, score: f32) -> SourceReference {
        let mut source = SourceReference {
            document: chunk.document_name.clone(),
            page: chunk.page_number,
            chapter: chunk.chapter.clone(),
            section: chunk.section.clone(),
            topics: chunk.topics.clone(),
            relevance: score,
            thumbnail_url: None,
            fullsize_url: None,
            highlighted_url: None,
        };

        if let Some(page) = chunk.page_number {
            let slug = Self::slug(&chunk.document_name);
            if self.thumbnail_path(&chunk.document_name, page).is_file() {
                source.thumbnail_url = Some(format!("/api/pages/{slug}/{page}/thumbnail"));
            }
            if self.fullsize_path(&chunk.document_name, page).is_file() {
                source.fullsize_url = Some(format!("/api/pages/{slug}/{page}/full"));
            }
        }

        source
    }
}

/// `{page}` or `{page}_{terms key}`.
fn is_page_suffix(rest: &str) -> bool {
    let (page, key) = match rest.split_once('_') {
        Some((page, key)) => (page, Some(key)),
        None => (rest, None),
    };
    !page.is_empty()
        && page.chars().all(|c| c.is_ascii_digit())
        && key.map_or(true, |key| !key.is_empty() && key.chars().all(|c| c.is_ascii_hexdigit()))
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
        .chars()
        .take(chars)
        .collect()
}

/// Order and case insensitive cache key for a term set.
fn terms_key(terms: &[String]) -> String {
    let mut normalized: Vec<String> = terms.iter().map(|term| term.to_lowercase()).collect();
    normalized.sort();
    normalized.dedup();
    hex_prefix(&Sha256::digest(normalized.join("\u{1f}").as_bytes()), 8)
}

/// Adds a highlighted locator carrying the terms to mark. Needs a full-size render.
pub fn with_highlight(mut source: SourceReference, terms: &[String]) -> SourceReference {
    let (Some(page), Some(_), false) = (source.page, &source.fullsize_url, terms.is_empty()) else {
        return source;
    };

    // Relative locator; a dummy base lets `Url` handle query encoding.
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return source;
    };
    url.set_path(&format!(
        "/api/pages/{}/{page}/highlighted",
        PageImages::slug(&source.document)
    ));
    url.query_pairs_mut().append_pair("terms", &terms.join(","));

    let query = url.query().unwrap_or_default();
    source.highlighted_url = Some(format!("{}?{query}", url.path()));
    source
}

async fn page_layout(pdf_path: &Path, page: i64) -> Result<PageLayout> {
    let output = Command::new("pdftotext")
        .arg("-bbox")
        .arg("-f")
        .arg(page.to_string())
        .arg("-l")
        .arg(page.to_string())
        .arg(pdf_path)
        .arg("-")
        .output()
        .await
        .with_context(|| format!("failed to run pdftotext -bbox for page {page}"))?;

    if !output.status.success() {
        anyhow::bail!(
            "pdftotext -bbox failed for page {page}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_bbox_layout(&String::from_utf8_lossy(&output.stdout))
        .with_context(|| format!("no layout for page {page} of {}", pdf_path.display()))
}

/// Reads the first page of poppler's `-bbox` XHTML output.
pub(crate) fn parse_bbox_layout(xhtml: &str) -> Option<PageLayout> {
    let page_re = Regex::new(r#"<page width="([\d.]+)" height="([\d.]+)">"#).ok()?;
    let word_re = Regex::new(
        r#"<word xMin="([\d.]+)" yMin="([\d.]+)" xMax="([\d.]+)" yMax="([\d.]+)">([^<]*)</word>"#,
    )
    .ok()?;

    let page = page_re.captures(xhtml)?;
    let body_start = page.get(0)?.end();
    let body_end = xhtml[body_start..]
        .find("</page>")
        .map_or(xhtml.len(), |idx| body_start + idx);

    let words = word_re
        .captures_iter(&xhtml[body_start..body_end])
        .filter_map(|caps| {
            Some(WordBox {
                x_min: caps[1].parse().ok()?,
                y_min: caps[2].parse().ok()?,
                x_max: caps[3].parse().ok()?,
                y_max: caps[4].parse().ok()?,
                text: unescape_xml(&caps[5]),
            })
        })
        .collect();

    Some(PageLayout {
        width: page[1].parse().ok()?,
        height: page[2].parse().ok()?,
        words,
    })
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn normalize_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Boxes of every word run that spells one of `terms`, ignoring case and
/// surrounding punctuation.
pub(crate) fn match_terms(layout: &PageLayout, terms: &[String]) -> Vec<WordBox> {
    let words: Vec<String> = layout.words.iter().map(|w| normalize_word(&w.text)).collect();
    let mut marked = vec![false; words.len()];

    for term in terms {
        let needle: Vec<String> = term
            .split_whitespace()
            .map(normalize_word)
            .filter(|w| !w.is_empty())
            .collect();
        if needle.is_empty() || needle.len() > words.len() {
            continue;
        }
        for start in 0..=words.len() - needle.len() {
            if words[start..start + needle.len()] == needle[..] {
                marked[start..start + needle.len()]
                    .iter_mut()
                    .for_each(|m| *m = true);
            }
        }
    }

    layout
        .words
        .iter()
        .zip(marked)
        .filter_map(|(word, hit)| hit.then(|| word.clone()))
        .collect()
}

/// Blends the highlight colour over each box, scaled from points to pixels.
pub(crate) fn paint_highlights(img: &mut RgbaImage, boxes: &[WordBox], scale_x: f32, scale_y: f32) {
    let (width, height) = img.dimensions();
    for word in boxes {
        let x0 = ((word.x_min * scale_x).floor().max(0.0) as u32).min(width);
        let y0 = ((word.y_min * scale_y).floor().max(0.0) as u32).min(height);
        let x1 = ((word.x_max * scale_x).ceil().max(0.0) as u32).min(width);
        let y1 = ((word.y_max * scale_y).ceil().max(0.0) as u32).min(height);

        for y in y0..y1 {
            for x in x0..x1 {
                let Rgba([r, g, b, a]) = *img.get_pixel(x, y);
                let blend = |base: u8, tint: u8| {
                    (base as f32 * (1.0 - HIGHLIGHT_ALPHA) + tint as f32 * HIGHLIGHT_ALPHA).round() as u8
                };
                img.put_pixel(
                    x,
                    y,
                    Rgba([
                        blend(r, HIGHLIGHT_COLOR[0]),
                        blend(g, HIGHLIGHT_COLOR[1]),
                        blend(b, HIGHLIGHT_COLOR[2]),
                        a,
                    ]),
                );
            }
        }
    }
}

/// Measurements with units, capitalized phrases and quoted text, in order of
/// appearance, case-insensitively de-duplicated, at most ten.
pub fn extract_key_terms(text: &str) -> Vec<String> {
    let patterns = [
        (r"(?i)\d+\.?\d*\s*(?:qt|quart|psi|mile|km|liter|gallon|inch|mm|°)", 0usize),
        (r"\b[A-Z][A-Za-z]+(?:\s+[A-Z][A-Za-z]+)*\b", 0),
        (r#""([^"]+)""#, 1),
    ];

    let mut terms: Vec<String> = Vec::new();
    for (idx, (pattern, group)) in patterns.iter().enumerate() {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        for caps in re.captures_iter(text) {
            let Some(m) = caps.get(*group) else {
                continue;
            };
            let term = m.as_str().trim();
            if idx == 1 && term.chars().count() <= 3 {
                continue;
            }
            terms.push(term.to_string());
        }
    }

    let mut seen = std::collections::HashSet::new();
    terms
        .into_iter()
        .filter(|term| term.chars().count() > 2 && seen.insert(term.to_lowercase()))
        .take(MAX_KEY_TERMS)
        .collect()
}

async fn render_page(pdf_path: &Path, page: i64, width: u32, out: &Path) -> Result<bool> {
    // pdftoppm appends ".png" to the output root.
    let root = out.with_extension("");
    let output = Command::new("pdftoppm")
        .arg("-png")
        .arg("-f")
        .arg(page.to_string())
        .arg("-l")
        .arg(page.to_string())
        .arg("-singlefile")
        .arg("-scale-to")
        .arg(width.to_string())
        .arg(pdf_path)
        .arg(&root)
        .output()
        .await
        .with_context(|| format!("failed to run pdftoppm for page {page}"))?;

    if !output.status.success() {
        tracing::warn!(
            page,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "pdftoppm failed for page"
        );
        return Ok(false);
    }
    Ok(true)
}
