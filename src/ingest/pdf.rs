use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;

use crate::chunker::PageText;

/// Per-page text. Uses poppler's `pdftotext` when installed so page numbers
/// are exact; otherwise falls back to `pdf-extract`, splitting on form feeds.
pub async fn extract_pages(pdf_path: &Path) -> Result<Vec<PageText>> {
    let mut pages = Vec::new();

    if has_command("pdftotext").await {
        let page_count = page_count(pdf_path).await.unwrap_or(0);
        for page in 1..=page_count {
            let output = Command::new("pdftotext")
                .arg("-f")
                .arg(page.to_string())
                .arg("-l")
                .arg(page.to_string())
                .arg("-nopgbrk")
                .arg(pdf_path)
                .arg("-")
                .output()
                .await
                .with_context(|| format!("failed to run pdftotext for page {}", page))?;

            if !output.status.success() {
                tracing::warn!(page, path = %pdf_path.display(), "pdftotext failed for page");
                continue;
            }

            let text = clean_text(&String::from_utf8_lossy(&output.stdout));
            if text.trim().is_empty() {
                continue;
            }
            pages.push(PageText::new(page as i64, text));
        }
    }

    if pages.is_empty() {
        let owned = pdf_path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&owned))
            .await
            .context("PDF extraction task panicked")?
            .context("failed to extract text from PDF")?;

        pages = split_form_feeds(&clean_text(&extracted));
    }

    Ok(pages)
}

pub async fn page_count(pdf_path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(pdf_path)
        .output()
        .await
        .context("failed to run pdfinfo")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("pdfinfo exited with non-zero status"));
    }

    parse_page_count(&String::from_utf8_lossy(&output.stdout))
}

fn parse_page_count(pdfinfo_stdout: &str) -> Result<usize> {
    let regex = Regex::new(r"(?m)^Pages:\s+(\d+)\s*$")?;
    regex
        .captures(pdfinfo_stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .ok_or_else(|| anyhow::anyhow!("unable to parse page count from pdfinfo"))
}

/// Without form feeds there is no page information, so the whole text
/// becomes one page with no number.
fn split_form_feeds(text: &str) -> Vec<PageText> {
    if !text.contains('\u{000C}') {
        if text.trim().is_empty() {
            return vec![];
        }
        return vec![PageText {
            page_number: None,
            text: text.to_string(),
        }];
    }

    text.split('\u{000C}')
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(idx, page)| PageText::new(idx as i64 + 1, page))
        .collect()
}

pub(crate) async fn has_command(binary: &str) -> bool {
    // Some poppler tools return non-zero for --version, so check PATH via `which`.
    Command::new("which")
        .arg(binary)
        .output()
        .await
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}

/// Smart quotes and NBSP normalized; line structure kept for paragraph detection.
fn clean_text(input: &str) -> String {
    input
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace('\u{00A0}', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pdfinfo_page_count() {
        let stdout = "Title:          Owner's Manual\nPages:          612\nEncrypted:      no\n";
        assert_eq!(parse_page_count(stdout).unwrap(), 612);
        assert!(parse_page_count("Title: x\n").is_err());
    }

    #[test]
    fn form_feeds_become_numbered_pages_and_blank_pages_are_skipped() {
        let pages = split_form_feeds("first page\u{000C}\n\u{000C}third page");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page_number, Some(1));
        assert_eq!(pages[1].page_number, Some(3));
        assert_eq!(pages[1].text, "third page");
    }

    #[test]
    fn text_without_page_breaks_is_a_single_unnumbered_page() {
        let pages = split_form_feeds("just\n\nsome text");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_number, None);
        assert!(split_form_feeds("  \n ").is_empty());
    }

    #[test]
    fn clean_text_keeps_newlines_and_straightens_quotes() {
        assert_eq!(
            clean_text("\u{201C}Check\u{201D}\u{00A0}oil\n\nnow"),
            "\"Check\" oil\n\nnow"
        );
    }
}
