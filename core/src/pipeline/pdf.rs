use anyhow::{anyhow, Result};
use lopdf::{Bookmark, Document, Object};
use std::collections::BTreeMap;
use tracing::warn;

/// Number of pages in a PDF, or an error for unreadable input.
pub fn page_count(bytes: &[u8]) -> Result<u32> {
  let document = Document::load_mem(bytes).map_err(|e| anyhow!("unreadable pdf: {}", e))?;
  Ok(document.get_pages().len() as u32)
}

/// Extracts a single 1-based page into a standalone PDF.
pub fn extract_page(bytes: &[u8], page_number: u32) -> Result<Vec<u8>> {
  let mut document = Document::load_mem(bytes).map_err(|e| anyhow!("unreadable pdf: {}", e))?;
  let pages: Vec<u32> = document.get_pages().keys().copied().collect();
  if !pages.contains(&page_number) {
    return Err(anyhow!("page {} out of range", page_number));
  }
  let to_delete: Vec<u32> = pages.into_iter().filter(|n| *n != page_number).collect();
  document.delete_pages(&to_delete);
  document.prune_objects();
  let mut buffer = Vec::new();
  document.save_to(&mut buffer)?;
  Ok(buffer)
}

/// Merges documents in the given order into one PDF with a bookmark at the
/// first page of each source. Corrupt sources are skipped with a warning;
/// the merge only fails when nothing merged.
pub fn merge_documents(sources: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>> {
  let mut max_id = 1;
  let mut documents_pages: BTreeMap<lopdf::ObjectId, Object> = BTreeMap::new();
  let mut documents_objects: BTreeMap<lopdf::ObjectId, Object> = BTreeMap::new();
  let mut document = Document::with_version("1.5");
  let mut merged_sources = 0;

  for (name, bytes) in sources {
    let mut source = match Document::load_mem(&bytes) {
      Ok(source) => source,
      Err(e) => {
        warn!(
          message = e.to_string(),
          source = name.as_str(),
          "Skipping corrupt pdf during merge"
        );
        continue;
      }
    };
    source.renumber_objects_with(max_id);
    max_id = source.max_id + 1;

    let mut first = true;
    for (_, object_id) in source.get_pages() {
      if first {
        document.add_bookmark(Bookmark::new(name.clone(), [0.0, 0.0, 1.0], 0, object_id), None);
        first = false;
      }
      if let Ok(object) = source.get_object(object_id) {
        documents_pages.insert(object_id, object.to_owned());
      }
    }
    documents_objects.extend(source.objects.clone());
    merged_sources += 1;
  }

  if merged_sources == 0 {
    return Err(anyhow!("no readable pdfs to merge"));
  }

  let mut catalog_object: Option<(lopdf::ObjectId, Object)> = None;
  let mut pages_object: Option<(lopdf::ObjectId, Object)> = None;

  for (object_id, object) in documents_objects.iter() {
    match object.type_name().unwrap_or("") {
      "Catalog" => {
        catalog_object = Some((
          if let Some((id, _)) = catalog_object {
            id
          } else {
            *object_id
          },
          object.clone(),
        ));
      }
      "Pages" => {
        if let Ok(dictionary) = object.as_dict() {
          let mut dictionary = dictionary.clone();
          if let Some((_, ref object)) = pages_object {
            if let Ok(old_dictionary) = object.as_dict() {
              dictionary.extend(old_dictionary);
            }
          }
          pages_object = Some((
            if let Some((id, _)) = pages_object {
              id
            } else {
              *object_id
            },
            Object::Dictionary(dictionary),
          ));
        }
      }
      "Page" | "Outlines" | "Outline" => {}
      _ => {
        document.objects.insert(*object_id, object.clone());
      }
    }
  }

  let pages_object = pages_object.ok_or_else(|| anyhow!("no pages root found"))?;
  let catalog_object = catalog_object.ok_or_else(|| anyhow!("no catalog found"))?;

  for (object_id, object) in documents_pages.iter() {
    if let Ok(dictionary) = object.as_dict() {
      let mut dictionary = dictionary.clone();
      dictionary.set("Parent", pages_object.0);
      document.objects.insert(*object_id, Object::Dictionary(dictionary));
    }
  }

  if let Ok(dictionary) = pages_object.1.as_dict() {
    let mut dictionary = dictionary.clone();
    dictionary.set("Count", documents_pages.len() as u32);
    dictionary.set(
      "Kids",
      documents_pages
        .keys()
        .map(|object_id| Object::Reference(*object_id))
        .collect::<Vec<_>>(),
    );
    document
      .objects
      .insert(pages_object.0, Object::Dictionary(dictionary));
  }

  if let Ok(dictionary) = catalog_object.1.as_dict() {
    let mut dictionary = dictionary.clone();
    dictionary.set("Pages", pages_object.0);
    dictionary.remove(b"Outlines");
    document
      .objects
      .insert(catalog_object.0, Object::Dictionary(dictionary));
  }

  document.trailer.set("Root", catalog_object.0);
  document.max_id = document.objects.len() as u32;
  document.renumber_objects();
  document.adjust_zero_pages();

  if let Some(outline_id) = document.build_outline() {
    if let Ok(Object::Dictionary(dictionary)) = document.get_object_mut(catalog_object.0) {
      dictionary.set("Outlines", Object::Reference(outline_id));
    }
  }

  document.compress();
  let mut buffer = Vec::new();
  document.save_to(&mut buffer)?;
  Ok(buffer)
}

#[cfg(test)]
pub mod test_support {
  use lopdf::{dictionary, Document, Object, Stream};

  /// Builds a simple PDF with one page per entry; each page draws its text.
  pub fn build_pdf(page_texts: &[&str]) -> Vec<u8> {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let font_id = document.add_object(dictionary! {
      "Type" => "Font",
      "Subtype" => "Type1",
      "BaseFont" => "Helvetica",
    });
    let resources_id = document.add_object(dictionary! {
      "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in page_texts {
      let content = lopdf::content::Content {
        operations: vec![
          lopdf::content::Operation::new("BT", vec![]),
          lopdf::content::Operation::new("Tf", vec!["F1".into(), 24.into()]),
          lopdf::content::Operation::new("Td", vec![100.into(), 700.into()]),
          lopdf::content::Operation::new("Tj", vec![Object::string_literal(*text)]),
          lopdf::content::Operation::new("ET", vec![]),
        ],
      };
      let content_id = document.add_object(Stream::new(
        dictionary! {},
        content.encode().unwrap(),
      ));
      let page_id = document.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
      });
      kids.push(page_id.into());
    }

    let page_count = kids.len() as u32;
    document.objects.insert(
      pages_id,
      Object::Dictionary(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => page_count,
      }),
    );
    let catalog_id = document.add_object(dictionary! {
      "Type" => "Catalog",
      "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    document.save_to(&mut buffer).unwrap();
    buffer
  }
}

#[cfg(test)]
mod tests {
  use super::{test_support::build_pdf, *};

  #[test]
  fn test_page_count() {
    let bytes = build_pdf(&["one", "two", "three"]);
    assert_eq!(page_count(&bytes).unwrap(), 3);
    assert!(page_count(b"not a pdf").is_err());
  }

  #[test]
  fn test_extract_page_produces_single_page_documents() {
    let bytes = build_pdf(&["alpha", "beta"]);
    let page = extract_page(&bytes, 2).unwrap();
    assert_eq!(page_count(&page).unwrap(), 1);

    let document = Document::load_mem(&page).unwrap();
    let pages: Vec<u32> = document.get_pages().keys().copied().collect();
    let text = document.extract_text(&pages).unwrap();
    assert!(text.contains("beta"));
    assert!(!text.contains("alpha"));

    assert!(extract_page(&bytes, 9).is_err());
  }

  #[test]
  fn test_merge_keeps_discovery_order_and_skips_corrupt_sources() {
    let first = build_pdf(&["first"]);
    let second = build_pdf(&["second", "second-b"]);
    let merged = merge_documents(vec![
      ("first.pdf".to_string(), first),
      ("broken.pdf".to_string(), b"garbage".to_vec()),
      ("second.pdf".to_string(), second),
    ])
    .unwrap();
    assert_eq!(page_count(&merged).unwrap(), 3);

    assert!(merge_documents(vec![("broken.pdf".to_string(), b"junk".to_vec())]).is_err());
  }
}
