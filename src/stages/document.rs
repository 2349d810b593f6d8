//! Loading source documents as ordered pages.
//!
//! [`FsDocumentLoader`] understands four layouts:
//! - PDF files, split into pages with `lopdf`; each page carries its text
//!   layer and, for scanned pages, the embedded JPEG
//! - text or markdown files, with pages separated by form feeds (the layout
//!   produced by PDF text extraction tools)
//! - a single page image (`png`, `jpg`, `jpeg`)
//! - a directory of pre-rendered pages, where a number in each file name
//!   gives the page (`page_1.png`, `page_1.md`, `003.png`)
//!
//! Blank pages are skipped, but the remaining pages keep their position in
//! the source document.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use lopdf::{Dictionary, Document, Object, ObjectId};
use walkdir::WalkDir;

use crate::error::DocumentError;
use crate::registry::SourceFile;

const PAGE_BREAK: char = '\u{000C}';
const TEXT_EXTENSIONS: [&str; 3] = ["txt", "md", "markdown"];
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const PDF_EXTENSION: &str = "pdf";
/// Bound on `Parent` hops when looking up inherited page resources.
const MAX_PAGE_TREE_DEPTH: usize = 32;

/// One page of a source document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    /// 1-based page number.
    pub number: usize,
    pub text: String,
    pub image: Option<Vec<u8>>,
}

/// Source of document pages for the parse stage.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Loads every page of `source`, ordered by page number.
    async fn load(&self, source: &SourceFile) -> Result<Vec<Page>, DocumentError>;
}

/// Loads documents from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsDocumentLoader;

impl FsDocumentLoader {
    pub fn new() -> Self {
        Self
    }

    async fn load_file(&self, path: &Path) -> Result<Vec<Page>, DocumentError> {
        let extension = extension_of(path);

        if extension == PDF_EXTENSION {
            let bytes = tokio::fs::read(path).await?;
            let pdf_error = |message: String| DocumentError::Pdf {
                path: path.display().to_string(),
                message,
            };
            return tokio::task::spawn_blocking(move || pdf_pages(&bytes))
                .await
                .map_err(|e| pdf_error(e.to_string()))?
                .map_err(|e| pdf_error(e.to_string()));
        }

        if TEXT_EXTENSIONS.contains(&extension.as_str()) {
            let content = tokio::fs::read_to_string(path).await?;
            return Ok(split_pages(&content));
        }

        if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            let image = tokio::fs::read(path).await?;
            return Ok(vec![Page {
                number: 1,
                text: String::new(),
                image: Some(image),
            }]);
        }

        Err(DocumentError::Unsupported {
            path: path.display().to_string(),
            extension,
        })
    }

    async fn load_dir(&self, dir: &Path) -> Result<Vec<Page>, DocumentError> {
        let mut pages: BTreeMap<usize, Page> = BTreeMap::new();

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let Some(number) = page_number(path) else {
                tracing::debug!(path = %path.display(), "Skipping file without page number");
                continue;
            };
            let extension = extension_of(path);

            if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
                let image = tokio::fs::read(path).await?;
                pages.entry(number).or_default().image = Some(image);
            } else if TEXT_EXTENSIONS.contains(&extension.as_str()) {
                let text = tokio::fs::read_to_string(path).await?;
                pages.entry(number).or_default().text = text.trim().to_string();
            }
        }

        Ok(pages
            .into_iter()
            .map(|(number, mut page)| {
                page.number = number;
                page
            })
            .collect())
    }
}

#[async_trait]
impl DocumentLoader for FsDocumentLoader {
    async fn load(&self, source: &SourceFile) -> Result<Vec<Page>, DocumentError> {
        let pages = if source.path.is_dir() {
            self.load_dir(&source.path).await?
        } else {
            self.load_file(&source.path).await?
        };

        if pages.is_empty() {
            return Err(DocumentError::Empty(source.name.clone()));
        }

        tracing::debug!(document = %source.name, pages = pages.len(), "Loaded document");
        Ok(pages)
    }
}

/// Whether `path` has an extension [`FsDocumentLoader`] can read.
pub fn is_supported_file(path: &Path) -> bool {
    let extension = extension_of(path);
    extension == PDF_EXTENSION
        || TEXT_EXTENSIONS.contains(&extension.as_str())
        || IMAGE_EXTENSIONS.contains(&extension.as_str())
}

/// Whether `dir` directly holds page images, making it a single document.
pub fn is_page_directory(dir: &Path) -> bool {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| {
            e.file_type().is_file()
                && IMAGE_EXTENSIONS.contains(&extension_of(e.path()).as_str())
                && page_number(e.path()).is_some()
        })
}

/// Splits extracted text into pages on form feeds. Blank pages are dropped
/// without renumbering the pages after them.
pub fn split_pages(content: &str) -> Vec<Page> {
    content
        .split(PAGE_BREAK)
        .enumerate()
        .map(|(idx, text)| (idx + 1, text.trim()))
        .filter(|(_, text)| !text.is_empty())
        .map(|(number, text)| Page {
            number,
            text: text.to_string(),
            image: None,
        })
        .collect()
}

/// Splits a PDF into pages numbered as in the document.
///
/// Text comes from the page's content stream. A page that embeds a JPEG
/// image (the usual shape of a scan) also carries that image.
pub fn pdf_pages(bytes: &[u8]) -> Result<Vec<Page>, lopdf::Error> {
    let doc = Document::load_mem(bytes)?;
    let mut pages = Vec::new();

    for (number, page_id) in doc.get_pages() {
        let text = match doc.extract_text(&[number]) {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::debug!(page = number, error = %e, "No extractable text on PDF page");
                String::new()
            }
        };
        let image = page_jpeg(&doc, page_id);
        if text.is_empty() && image.is_none() {
            continue;
        }
        pages.push(Page {
            number: number as usize,
            text,
            image,
        });
    }
    Ok(pages)
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn dict_entry<'a>(doc: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Dictionary> {
    let object = dict.get(key).ok()?;
    resolve(doc, object)?.as_dict().ok()
}

/// The page's `XObject` resources, following inheritance up the page tree.
fn page_xobjects(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_PAGE_TREE_DEPTH {
        if let Some(xobjects) =
            dict_entry(doc, node, b"Resources").and_then(|r| dict_entry(doc, r, b"XObject"))
        {
            return Some(xobjects);
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn is_name(object: Result<&Object, lopdf::Error>, name: &[u8]) -> bool {
    match object {
        Ok(Object::Name(n)) => n.as_slice() == name,
        Ok(Object::Array(items)) => {
            items.len() == 1 && matches!(&items[0], Object::Name(n) if n.as_slice() == name)
        }
        _ => false,
    }
}

/// First DCT-encoded image drawn on the page, as raw JPEG bytes.
fn page_jpeg(doc: &Document, page_id: ObjectId) -> Option<Vec<u8>> {
    let xobjects = page_xobjects(doc, page_id)?;
    xobjects.iter().find_map(|(_, object)| {
        let stream = resolve(doc, object)?.as_stream().ok()?;
        let jpeg = is_name(stream.dict.get(b"Subtype"), b"Image")
            && is_name(stream.dict.get(b"Filter"), b"DCTDecode");
        jpeg.then(|| stream.content.clone())
    })
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// The last run of digits in the file stem, e.g. `page_12` -> 12.
fn page_number(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_string_lossy();
    let digits: String = stem
        .chars()
        .rev()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_split_pages_on_form_feed() {
        let pages = split_pages("First page\u{000C}Second page\u{000C}\n\u{000C}Fourth\u{000C}");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].number, 1);
        assert_eq!(pages[1].text, "Second page");
        // The blank third page is skipped, not renumbered away.
        assert_eq!(pages[2].number, 4);
        assert_eq!(pages[2].text, "Fourth");
    }

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

    /// A three page PDF: text, blank, and a scanned image.
    fn sample_pdf() -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Stream};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let text = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal("Ledger accounts")]),
                Operation::new("ET", vec![]),
            ],
        };
        let text_id = doc.add_object(Stream::new(dictionary! {}, text.encode().unwrap()));
        let blank_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));

        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 1,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            JPEG.to_vec(),
        ));
        let draw = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new("Do", vec!["Im1".into()]),
                Operation::new("Q", vec![]),
            ],
        };
        let draw_id = doc.add_object(Stream::new(dictionary! {}, draw.encode().unwrap()));

        let page = |contents: ObjectId| {
            dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => contents,
            }
        };
        let first = doc.add_object(page(text_id));
        let second = doc.add_object(page(blank_id));
        let mut scanned = page(draw_id);
        scanned.set(
            "Resources",
            dictionary! { "XObject" => dictionary! { "Im1" => image_id } },
        );
        let third = doc.add_object(scanned);

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![first.into(), second.into(), third.into()],
                "Count" => 3,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_load_pdf_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("statement.pdf");
        std::fs::write(&path, sample_pdf()).unwrap();

        let source = SourceFile::new(Uuid::new_v4(), &path);
        let pages = FsDocumentLoader::new().load(&source).await.unwrap();
        let numbers: Vec<usize> = pages.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert!(pages[0].text.contains("Ledger"), "{:?}", pages[0].text);
        assert!(pages[0].image.is_none());
        assert_eq!(pages[1].image.as_deref(), Some(JPEG));
    }

    #[tokio::test]
    async fn test_corrupt_pdf_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.5 not really").unwrap();

        let result = FsDocumentLoader::new()
            .load(&SourceFile::new(Uuid::new_v4(), &path))
            .await;
        assert!(matches!(
            result,
            Err(DocumentError::Pdf { .. }) | Err(DocumentError::Empty(_))
        ));
    }

    #[test]
    fn test_page_number_from_file_name() {
        assert_eq!(page_number(Path::new("/x/page_12.png")), Some(12));
        assert_eq!(page_number(Path::new("/x/003.md")), Some(3));
        assert_eq!(page_number(Path::new("/x/scan2_page7.png")), Some(7));
        assert_eq!(page_number(Path::new("/x/cover.png")), None);
    }

    #[tokio::test]
    async fn test_load_text_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manual.txt");
        std::fs::write(&path, "Intro\u{000C}Chapter 1").unwrap();

        let source = SourceFile::new(Uuid::new_v4(), &path);
        let pages = FsDocumentLoader::new().load(&source).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].text, "Chapter 1");
        assert!(pages[0].image.is_none());
    }

    #[tokio::test]
    async fn test_load_page_directory_orders_numerically() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("page_10.png"), b"img10").unwrap();
        std::fs::write(dir.path().join("page_2.png"), b"img2").unwrap();
        std::fs::write(dir.path().join("page_2.md"), "  text two ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = SourceFile::new(Uuid::new_v4(), dir.path());
        let pages = FsDocumentLoader::new().load(&source).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 2);
        assert_eq!(pages[0].text, "text two");
        assert_eq!(pages[0].image.as_deref(), Some(&b"img2"[..]));
        assert_eq!(pages[1].number, 10);
    }

    #[tokio::test]
    async fn test_unsupported_and_empty_documents() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("report.docx");
        std::fs::write(&binary, b"PK").unwrap();
        let result = FsDocumentLoader::new()
            .load(&SourceFile::new(Uuid::new_v4(), &binary))
            .await;
        assert!(matches!(result, Err(DocumentError::Unsupported { .. })));

        let blank = dir.path().join("blank.txt");
        std::fs::write(&blank, "  \u{000C}  ").unwrap();
        let result = FsDocumentLoader::new()
            .load(&SourceFile::new(Uuid::new_v4(), &blank))
            .await;
        assert!(matches!(result, Err(DocumentError::Empty(_))));
    }

    #[test]
    fn test_supported_files_and_page_directories() {
        assert!(is_supported_file(Path::new("/x/manual.TXT")));
        assert!(is_supported_file(Path::new("/x/scan.jpeg")));
        assert!(is_supported_file(Path::new("/x/statement.PDF")));
        assert!(!is_supported_file(Path::new("/x/report.docx")));

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("manual.txt"), "text").unwrap();
        assert!(!is_page_directory(dir.path()));
        std::fs::write(dir.path().join("page_1.png"), b"img").unwrap();
        assert!(is_page_directory(dir.path()));
    }
}
