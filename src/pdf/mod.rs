//! lopdf-backed page source
//!
//! [`LopdfSource`] hands out one [`LopdfPage`] per page. Creating the handle
//! resolves the page's content stream and every image and form reachable from
//! its resources, so the handle no longer needs the document. Resolved
//! XObjects are shared by id across all page handles of a source.
//! Materializing the page interprets its operators and fills the object table
//! with every image that is actually drawn.

mod xobject;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use crate::collector::{ObjectTable, PageSource, PdfSource};
use crate::error::SourceError;

use xobject::ImageXObject;

const MAX_INHERITANCE_DEPTH: usize = 32;
const MAX_FORM_DEPTH: usize = 16;

/// Named XObjects available to one content stream.
type XObjectNames = HashMap<Vec<u8>, XObjectRef>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XObjectRef {
    Image(ObjectId),
    Form(ObjectId),
}

#[derive(Debug)]
struct FormXObject {
    content: Vec<u8>,
    xobjects: XObjectNames,
}

impl FormXObject {
    fn resolve(doc: &Document, stream: &Stream) -> Result<Self, String> {
        let content = xobject::stream_bytes(stream)?;
        let xobjects = stream
            .dict
            .get(b"Resources")
            .ok()
            .and_then(|res| resolve_dict(doc, res))
            .map(|res| xobject_names(doc, res))
            .unwrap_or_default();
        Ok(Self { content, xobjects })
    }
}

/// Resolved XObjects keyed by object id.
#[derive(Debug, Default)]
struct XObjectTable {
    images: HashMap<ObjectId, Arc<ImageXObject>>,
    forms: HashMap<ObjectId, Arc<FormXObject>>,
}

impl XObjectTable {
    fn image(&mut self, doc: &Document, id: ObjectId) -> Option<Arc<ImageXObject>> {
        if let Some(image) = self.images.get(&id) {
            return Some(Arc::clone(image));
        }
        let Ok(Object::Stream(stream)) = doc.get_object(id) else {
            return None;
        };
        let image = Arc::new(ImageXObject::resolve(doc, id, stream));
        self.images.insert(id, Arc::clone(&image));
        Some(image)
    }

    fn form(&mut self, doc: &Document, id: ObjectId) -> Option<Arc<FormXObject>> {
        if let Some(form) = self.forms.get(&id) {
            return Some(Arc::clone(form));
        }
        let Ok(Object::Stream(stream)) = doc.get_object(id) else {
            return None;
        };
        match FormXObject::resolve(doc, stream) {
            Ok(form) => {
                let form = Arc::new(form);
                self.forms.insert(id, Arc::clone(&form));
                Some(form)
            }
            Err(e) => {
                log::warn!("[Pdf] Form {} {}: {}", id.0, id.1, e);
                None
            }
        }
    }
}

/// A PDF document loaded with lopdf.
#[derive(Debug)]
pub struct LopdfSource {
    doc: Document,
    page_ids: Vec<ObjectId>,
    resolved: Mutex<XObjectTable>,
}

impl LopdfSource {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        Ok(Self::from_document(Document::load(path)?))
    }

    pub fn load_mem(bytes: &[u8]) -> Result<Self, SourceError> {
        Ok(Self::from_document(Document::load_mem(bytes)?))
    }

    pub fn from_document(doc: Document) -> Self {
        let page_ids = doc.get_pages().into_values().collect();
        Self {
            doc,
            page_ids,
            resolved: Mutex::new(XObjectTable::default()),
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Every image and form reachable from `roots`, each resolved once per
    /// document.
    fn reachable(&self, roots: &XObjectNames) -> XObjectTable {
        let mut shared = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut reachable = XObjectTable::default();
        let mut pending: Vec<XObjectRef> = roots.values().copied().collect();

        while let Some(next) = pending.pop() {
            match next {
                XObjectRef::Image(id) if !reachable.images.contains_key(&id) => {
                    if let Some(image) = shared.image(&self.doc, id) {
                        reachable.images.insert(id, image);
                    }
                }
                XObjectRef::Form(id) if !reachable.forms.contains_key(&id) => {
                    if let Some(form) = shared.form(&self.doc, id) {
                        pending.extend(form.xobjects.values().copied());
                        reachable.forms.insert(id, form);
                    }
                }
                _ => {}
            }
        }

        reachable
    }
}

impl PdfSource for LopdfSource {
    type Page = LopdfPage;

    fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    fn page(&self, index: usize) -> Result<LopdfPage, SourceError> {
        let page_id = *self
            .page_ids
            .get(index)
            .ok_or(SourceError::PageOutOfRange {
                index,
                count: self.page_ids.len(),
            })?;

        let content = self.doc.get_page_content(page_id)?;
        let xobjects = page_resources(&self.doc, page_id)
            .map(|resources| xobject_names(&self.doc, resources))
            .unwrap_or_default();
        let resolved = self.reachable(&xobjects);

        log::debug!(
            "[Pdf] Page {}: {} content bytes, {} images, {} forms",
            index + 1,
            content.len(),
            resolved.images.len(),
            resolved.forms.len()
        );

        Ok(LopdfPage {
            index,
            content,
            xobjects,
            resolved,
            table: ObjectTable::new(),
        })
    }
}

/// One page of a [`LopdfSource`].
#[derive(Debug)]
pub struct LopdfPage {
    index: usize,
    content: Vec<u8>,
    xobjects: XObjectNames,
    resolved: XObjectTable,
    table: ObjectTable,
}

impl LopdfPage {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl PageSource for LopdfPage {
    async fn materialize_content(&mut self) -> Result<(), SourceError> {
        tokio::task::yield_now().await;

        let content = Content::decode(&self.content).map_err(|e| SourceError::Materialization {
            page: self.index,
            reason: e.to_string(),
        })?;

        let mut walker = DrawnImages::new(&self.resolved.forms);
        walker.walk(&content.operations, &self.xobjects, 0);

        for id in walker.drawn {
            let Some(image) = self.resolved.images.get(&id) else {
                continue;
            };
            self.table
                .entry(format!("{} {}", id.0, id.1))
                .or_insert_with(|| image.to_page_object());
        }

        log::debug!(
            "[Pdf] Page {}: {} objects after materialization ({} forms expanded)",
            self.index + 1,
            self.table.len(),
            walker.expanded.len()
        );
        Ok(())
    }

    fn object_table(&self) -> &ObjectTable {
        &self.table
    }
}

/// Walks `Do` operators. Each invoked form is expanded once per page.
struct DrawnImages<'a> {
    forms: &'a HashMap<ObjectId, Arc<FormXObject>>,
    expanded: HashSet<ObjectId>,
    drawn: BTreeSet<ObjectId>,
}

impl<'a> DrawnImages<'a> {
    fn new(forms: &'a HashMap<ObjectId, Arc<FormXObject>>) -> Self {
        Self {
            forms,
            expanded: HashSet::new(),
            drawn: BTreeSet::new(),
        }
    }

    fn walk(&mut self, operations: &[Operation], xobjects: &XObjectNames, depth: usize) {
        for operation in operations {
            if operation.operator != "Do" {
                continue;
            }
            let Some(Object::Name(name)) = operation.operands.first() else {
                continue;
            };

            match xobjects.get(name) {
                Some(XObjectRef::Image(id)) => {
                    self.drawn.insert(*id);
                }
                Some(XObjectRef::Form(id)) => self.expand(*id, depth),
                None => log::debug!(
                    "[Pdf] Do references unknown XObject /{}",
                    String::from_utf8_lossy(name)
                ),
            }
        }
    }

    fn expand(&mut self, id: ObjectId, depth: usize) {
        if depth >= MAX_FORM_DEPTH {
            log::debug!("[Pdf] Form {} {} nested too deeply", id.0, id.1);
            return;
        }
        let forms = self.forms;
        let Some(form) = forms.get(&id) else {
            return;
        };
        if !self.expanded.insert(id) {
            return;
        }

        match Content::decode(&form.content) {
            Ok(content) => self.walk(&content.operations, &form.xobjects, depth + 1),
            Err(e) => log::warn!("[Pdf] Form {} {}: undecodable content: {}", id.0, id.1, e),
        }
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Dictionary(d) => Some(d),
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        _ => None,
    }
}

/// Page resources, inherited from ancestors in the page tree when absent.
fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_INHERITANCE_DEPTH {
        if let Ok(resources) = node.get(b"Resources") {
            return resolve_dict(doc, resources);
        }
        node = match node.get(b"Parent") {
            Ok(Object::Reference(parent_id)) => doc.get_dictionary(*parent_id).ok()?,
            _ => return None,
        };
    }
    None
}

/// Image and form entries of the `/XObject` dictionary in `resources`.
fn xobject_names(doc: &Document, resources: &Dictionary) -> XObjectNames {
    let Some(entries) = resources
        .get(b"XObject")
        .ok()
        .and_then(|xobjects| resolve_dict(doc, xobjects))
    else {
        return XObjectNames::new();
    };

    entries
        .iter()
        .filter_map(|(name, value)| {
            let Object::Reference(id) = value else {
                return None;
            };
            let Ok(Object::Stream(stream)) = doc.get_object(*id) else {
                return None;
            };
            match stream.dict.get(b"Subtype") {
                Ok(Object::Name(subtype)) if subtype.as_slice() == b"Image" => {
                    Some((name.clone(), XObjectRef::Image(*id)))
                }
                Ok(Object::Name(subtype)) if subtype.as_slice() == b"Form" => {
                    Some((name.clone(), XObjectRef::Form(*id)))
                }
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn add_image(doc: &mut Document, rgb: [u8; 3]) -> ObjectId {
        let dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => Object::Integer(1),
            "Height" => Object::Integer(1),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => Object::Integer(8),
        };
        doc.add_object(Stream::new(dict, rgb.to_vec()))
    }

    fn add_form(doc: &mut Document, xobjects: Dictionary, content: &[u8]) -> ObjectId {
        let dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "Resources" => dictionary! { "XObject" => xobjects },
        };
        doc.add_object(Stream::new(dict, content.to_vec()))
    }

    fn with_pages(mut doc: Document, pages: Vec<(Dictionary, &[u8])>) -> LopdfSource {
        let pages_id = doc.new_object_id();
        let kids: Vec<Object> = pages
            .into_iter()
            .map(|(xobjects, content)| {
                let content_id = doc.add_object(Stream::new(dictionary! {}, content.to_vec()));
                Object::Reference(doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => Object::Reference(pages_id),
                    "Contents" => Object::Reference(content_id),
                    "Resources" => dictionary! { "XObject" => xobjects },
                }))
            })
            .collect();
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => Object::Integer(count),
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));
        LopdfSource::from_document(doc)
    }

    #[test]
    fn pages_share_resolved_xobjects() {
        let mut doc = Document::with_version("1.5");
        let image = add_image(&mut doc, [1, 2, 3]);
        let form = add_form(&mut doc, dictionary! { "Im0" => Object::Reference(image) }, b"/Im0 Do");
        let xobjects = || {
            dictionary! {
                "Im0" => Object::Reference(image),
                "Fm0" => Object::Reference(form),
            }
        };
        let source = with_pages(doc, vec![(xobjects(), &b"/Im0 Do"[..]), (xobjects(), &b"/Fm0 Do"[..])]);

        let first = source.page(0).unwrap();
        let second = source.page(1).unwrap();

        assert!(Arc::ptr_eq(
            &first.resolved.images[&image],
            &second.resolved.images[&image]
        ));
        assert!(Arc::ptr_eq(
            &first.resolved.forms[&form],
            &second.resolved.forms[&form]
        ));
        assert_eq!(source.resolved.lock().unwrap().images.len(), 1);
    }

    #[test]
    fn repeated_form_is_expanded_once() {
        let mut doc = Document::with_version("1.5");
        let image = add_image(&mut doc, [7, 7, 7]);
        let inner = add_form(&mut doc, dictionary! { "Im0" => Object::Reference(image) }, b"/Im0 Do /Im0 Do");
        let outer = add_form(
            &mut doc,
            dictionary! { "Fm1" => Object::Reference(inner) },
            b"/Fm1 Do /Fm1 Do /Fm1 Do",
        );
        let source = with_pages(
            doc,
            vec![(
                dictionary! {
                    "Fm0" => Object::Reference(outer),
                    "Fm1" => Object::Reference(inner),
                },
                &b"/Fm0 Do /Fm0 Do /Fm1 Do"[..],
            )],
        );
        let page = source.page(0).unwrap();

        let content = Content::decode(&page.content).unwrap();
        let mut walker = DrawnImages::new(&page.resolved.forms);
        walker.walk(&content.operations, &page.xobjects, 0);

        assert_eq!(walker.expanded.len(), 2);
        assert_eq!(walker.drawn.into_iter().collect::<Vec<_>>(), vec![image]);
    }

    #[test]
    fn form_cycle_keeps_images_reachable_from_either_entry() {
        let mut doc = Document::with_version("1.5");
        let a = add_image(&mut doc, [1, 1, 1]);
        let b = add_image(&mut doc, [2, 2, 2]);
        let first = doc.new_object_id();
        let second = add_form(
            &mut doc,
            dictionary! {
                "ImA" => Object::Reference(a),
                "Back" => Object::Reference(first),
            },
            b"/ImA Do /Back Do",
        );
        doc.objects.insert(
            first,
            Object::Stream(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Form",
                    "Resources" => dictionary! {
                        "XObject" => dictionary! {
                            "ImB" => Object::Reference(b),
                            "Next" => Object::Reference(second),
                        },
                    },
                },
                b"/ImB Do /Next Do".to_vec(),
            )),
        );
        let source = with_pages(
            doc,
            vec![
                (dictionary! { "Fm" => Object::Reference(first) }, &b"/Fm Do"[..]),
                (dictionary! { "Fm" => Object::Reference(second) }, &b"/Fm Do"[..]),
            ],
        );

        for index in 0..2 {
            let page = source.page(index).unwrap();
            let content = Content::decode(&page.content).unwrap();
            let mut walker = DrawnImages::new(&page.resolved.forms);
            walker.walk(&content.operations, &page.xobjects, 0);
            assert_eq!(walker.drawn, BTreeSet::from([a, b]), "page {index}");
        }
    }

    #[test]
    fn page_out_of_range() {
        let source = with_pages(Document::with_version("1.5"), Vec::new());
        assert!(matches!(
            source.page(0),
            Err(SourceError::PageOutOfRange { index: 0, count: 0 })
        ));
    }
}
