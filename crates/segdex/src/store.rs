//! Dataset store: load-time validation, inverted indices, and compound
//! filter queries over images, annotations, and categories.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Instant;

use log::{debug, info};

use crate::error::Error;
use crate::mask;
use crate::types::{Annotation, Category, Dataset, Image, Rle, Segmentation};

/// Inverted indices derived from the dataset in a single pass. Rebuilt in
/// full by `create_index`; never updated incrementally.
#[derive(Debug, Clone, Default, PartialEq)]
struct Index {
    /// annotation id -> position in `dataset.annotations`
    anns: HashMap<u64, usize>,
    /// image id -> position in `dataset.images`
    imgs: HashMap<u64, usize>,
    /// category id -> position in `dataset.categories`
    cats: HashMap<u64, usize>,
    /// image id -> annotation ids in dataset order
    img_to_anns: HashMap<u64, Vec<u64>>,
    /// category id -> image ids
    cat_to_imgs: HashMap<u64, BTreeSet<u64>>,
}

/// Owns one loaded dataset and its derived indices.
///
/// A store moves through three states: construction parses and validates the
/// dataset (referential integrity checked before anything else), and
/// [`create_index`](Self::create_index) makes it queryable. Query operations
/// return [`Error::NotIndexed`] until then. After indexing the store is
/// read-only and safe to share across reader threads.
pub struct AnnotationStore {
    dataset: Dataset,
    index: Option<Index>,
}

impl AnnotationStore {
    /// Parse a serialized dataset description from disk.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let started = Instant::now();
        let file = std::fs::File::open(path)?;
        let dataset: Dataset = serde_json::from_reader(std::io::BufReader::new(file))?;
        info!(
            "loaded dataset from {} in {:.2?}",
            path.display(),
            started.elapsed()
        );
        Self::from_dataset(dataset)
    }

    /// Take ownership of an already-deserialized dataset.
    ///
    /// Fails with [`Error::Validation`] if any annotation references a
    /// missing image or category, or if a crowd annotation carries a polygon
    /// segmentation instead of an RLE.
    pub fn from_dataset(dataset: Dataset) -> Result<Self, Error> {
        let images: BTreeSet<u64> = dataset.images.iter().map(|i| i.id).collect();
        let categories: BTreeSet<u64> = dataset.categories.iter().map(|c| c.id).collect();
        for ann in &dataset.annotations {
            if !images.contains(&ann.image_id) {
                return Err(Error::Validation(format!(
                    "annotation {} references missing image {}",
                    ann.id, ann.image_id
                )));
            }
            if !categories.contains(&ann.category_id) {
                return Err(Error::Validation(format!(
                    "annotation {} references missing category {}",
                    ann.id, ann.category_id
                )));
            }
            if ann.iscrowd && matches!(ann.segmentation, Some(Segmentation::Polygon(_))) {
                return Err(Error::Validation(format!(
                    "crowd annotation {} must carry an RLE segmentation",
                    ann.id
                )));
            }
        }
        Ok(AnnotationStore {
            dataset,
            index: None,
        })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Build every lookup structure from scratch.
    ///
    /// One pass over the annotations fills the by-id map, `img_to_anns`
    /// (dataset order), and `cat_to_imgs`; passes over images and categories
    /// fill their by-id maps. Deterministic and idempotent: rebuilding an
    /// unmodified store yields identical structures.
    pub fn create_index(&mut self) {
        let started = Instant::now();
        let mut index = Index::default();

        for (i, ann) in self.dataset.annotations.iter().enumerate() {
            index.anns.insert(ann.id, i);
            index
                .img_to_anns
                .entry(ann.image_id)
                .or_default()
                .push(ann.id);
            index
                .cat_to_imgs
                .entry(ann.category_id)
                .or_default()
                .insert(ann.image_id);
        }
        for (i, img) in self.dataset.images.iter().enumerate() {
            index.imgs.insert(img.id, i);
        }
        for (i, cat) in self.dataset.categories.iter().enumerate() {
            index.cats.insert(cat.id, i);
        }

        debug!(
            "indexed {} annotations across {} images and {} categories",
            index.anns.len(),
            index.imgs.len(),
            index.cats.len()
        );
        info!("index built in {:.2?}", started.elapsed());
        self.index = Some(index);
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    fn index(&self) -> Result<&Index, Error> {
        self.index.as_ref().ok_or(Error::NotIndexed)
    }

    /// Annotation ids matching every provided filter.
    ///
    /// The candidate set is all annotations in dataset order when `img_ids`
    /// is empty, otherwise the concatenation of each listed image's
    /// annotations in the order the images are given. Category, inclusive
    /// area-range, and crowd filters then narrow it in sequence; each stage
    /// keeps the previous stage's relative order (stable filtering — the
    /// result is never re-sorted). Empty/unset filters match everything.
    pub fn ann_ids(
        &self,
        img_ids: &[u64],
        cat_ids: &[u64],
        area_rng: Option<[f64; 2]>,
        iscrowd: Option<bool>,
    ) -> Result<Vec<u64>, Error> {
        let index = self.index()?;
        let candidates: Vec<u64> = if img_ids.is_empty() {
            self.dataset.annotations.iter().map(|a| a.id).collect()
        } else {
            img_ids
                .iter()
                .filter_map(|id| index.img_to_anns.get(id))
                .flatten()
                .copied()
                .collect()
        };

        let mut out = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(&slot) = index.anns.get(&id) else {
                continue;
            };
            let ann = &self.dataset.annotations[slot];
            if !cat_ids.is_empty() && !cat_ids.contains(&ann.category_id) {
                continue;
            }
            if let Some([lo, hi]) = area_rng {
                let area = ann.area.unwrap_or(0.0);
                if area < lo || area > hi {
                    continue;
                }
            }
            if let Some(crowd) = iscrowd {
                if ann.iscrowd != crowd {
                    continue;
                }
            }
            out.push(id);
        }
        Ok(out)
    }

    /// Category ids whose name, supercategory, and id pass every provided
    /// filter, in dataset order. Omitted filters are unconstrained.
    pub fn cat_ids(
        &self,
        names: &[&str],
        supercategories: &[&str],
        ids: &[u64],
    ) -> Result<Vec<u64>, Error> {
        self.index()?;
        Ok(self
            .dataset
            .categories
            .iter()
            .filter(|cat| {
                (names.is_empty() || names.contains(&cat.name.as_str()))
                    && (supercategories.is_empty()
                        || matches!(&cat.supercategory, Some(s) if supercategories.contains(&s.as_str())))
                    && (ids.is_empty() || ids.contains(&cat.id))
            })
            .map(|cat| cat.id)
            .collect())
    }

    /// Image ids, starting from all images (or the given `img_ids`, order
    /// preserved) and intersected with the images of `cat_ids` when present.
    pub fn img_ids(&self, img_ids: &[u64], cat_ids: &[u64]) -> Result<Vec<u64>, Error> {
        let index = self.index()?;
        let mut ids: Vec<u64> = if img_ids.is_empty() {
            self.dataset.images.iter().map(|img| img.id).collect()
        } else {
            img_ids.to_vec()
        };

        if !cat_ids.is_empty() {
            let mut member: BTreeSet<u64> = BTreeSet::new();
            for cid in cat_ids {
                if let Some(imgs) = index.cat_to_imgs.get(cid) {
                    member.extend(imgs.iter().copied());
                }
            }
            ids.retain(|id| member.contains(id));
        }
        Ok(ids)
    }

    /// Annotations in exactly the requested id order; all-or-nothing.
    pub fn load_anns(&self, ids: &[u64]) -> Result<Vec<&Annotation>, Error> {
        let index = self.index()?;
        ids.iter()
            .map(|id| {
                index
                    .anns
                    .get(id)
                    .map(|&i| &self.dataset.annotations[i])
                    .ok_or(Error::AnnotationNotFound(*id))
            })
            .collect()
    }

    /// Categories in exactly the requested id order; all-or-nothing.
    pub fn load_cats(&self, ids: &[u64]) -> Result<Vec<&Category>, Error> {
        let index = self.index()?;
        ids.iter()
            .map(|id| {
                index
                    .cats
                    .get(id)
                    .map(|&i| &self.dataset.categories[i])
                    .ok_or(Error::CategoryNotFound(*id))
            })
            .collect()
    }

    /// Images in exactly the requested id order; all-or-nothing.
    pub fn load_imgs(&self, ids: &[u64]) -> Result<Vec<&Image>, Error> {
        let index = self.index()?;
        ids.iter()
            .map(|id| {
                index
                    .imgs
                    .get(id)
                    .map(|&i| &self.dataset.images[i])
                    .ok_or(Error::ImageNotFound(*id))
            })
            .collect()
    }

    /// Normalize an annotation's segmentation into an RLE at its image's
    /// dimensions: polygons are rasterized and unioned, string counts are
    /// unpacked, literal counts are taken as-is, and a bare bbox is
    /// rasterized as a rectangle.
    pub fn ann_to_rle(&self, ann: &Annotation) -> Result<Rle, Error> {
        let index = self.index()?;
        let img = index
            .imgs
            .get(&ann.image_id)
            .map(|&i| &self.dataset.images[i])
            .ok_or(Error::ImageNotFound(ann.image_id))?;

        match &ann.segmentation {
            Some(seg) => resolve_segmentation(seg, img.height, img.width),
            None => match &ann.bbox {
                Some(bb) => Ok(mask::from_bbox(bb, img.height, img.width)),
                None => Err(Error::Validation(format!(
                    "annotation {} has neither segmentation nor bbox",
                    ann.id
                ))),
            },
        }
    }

    /// [`ann_to_rle`](Self::ann_to_rle) decoded to a dense binary mask.
    pub fn ann_to_mask(&self, ann: &Annotation) -> Result<Vec<u8>, Error> {
        mask::decode(&self.ann_to_rle(ann)?)
    }

    /// Load detection results from disk and attach them to this store's
    /// images and categories. Accepts either a bare annotation array or a
    /// full dataset description.
    pub fn load_results(&self, path: &Path) -> Result<AnnotationStore, Error> {
        let started = Instant::now();
        let text = std::fs::read_to_string(path)?;
        let anns: Vec<Annotation> = match serde_json::from_str::<Vec<Annotation>>(&text) {
            Ok(anns) => anns,
            Err(_) => serde_json::from_str::<Dataset>(&text)?.annotations,
        };
        info!(
            "loaded {} detection results from {} in {:.2?}",
            anns.len(),
            path.display(),
            started.elapsed()
        );
        self.results_from_annotations(anns)
    }

    /// Build an indexed detection store sharing this store's images and
    /// categories.
    ///
    /// Each detection gets a fresh 1-based sequential id and `iscrowd = 0`.
    /// Box detections get a bbox-derived area and a rectangle segmentation;
    /// mask-only detections get their area and bbox from the mask. A
    /// detection referencing an image this store does not hold is a
    /// validation error.
    pub fn results_from_annotations(
        &self,
        anns: Vec<Annotation>,
    ) -> Result<AnnotationStore, Error> {
        let index = self.index()?;
        let mut results = Vec::with_capacity(anns.len());
        for (i, mut ann) in anns.into_iter().enumerate() {
            let img = index
                .imgs
                .get(&ann.image_id)
                .map(|&slot| &self.dataset.images[slot])
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "detection references image {} not present in the dataset",
                        ann.image_id
                    ))
                })?;

            if let Some(bb) = ann.bbox {
                ann.area = Some(bb[2] * bb[3]);
                if ann.segmentation.is_none() {
                    let [x, y, bw, bh] = bb;
                    ann.segmentation = Some(Segmentation::Polygon(vec![vec![
                        x,
                        y,
                        x,
                        y + bh,
                        x + bw,
                        y + bh,
                        x + bw,
                        y,
                    ]]));
                }
            } else if let Some(seg) = &ann.segmentation {
                let rle = resolve_segmentation(seg, img.height, img.width)?;
                ann.area = Some(mask::area(&rle) as f64);
                ann.bbox = Some(mask::to_bbox(&rle));
            } else {
                return Err(Error::Validation(format!(
                    "detection row {i} has neither bbox nor segmentation"
                )));
            }
            ann.iscrowd = false;
            ann.id = (i + 1) as u64;
            results.push(ann);
        }

        let mut store = AnnotationStore::from_dataset(Dataset {
            info: self.dataset.info.clone(),
            images: self.dataset.images.clone(),
            annotations: results,
            categories: self.dataset.categories.clone(),
            licenses: self.dataset.licenses.clone(),
        })?;
        store.create_index();
        Ok(store)
    }

    /// Convert flat numeric detection rows into annotation records.
    ///
    /// Each row is a 7-tuple `[image_id, x, y, w, h, score, category_id]`;
    /// ids are assigned sequentially from 1 in row order. Stateless: no
    /// referential validation is performed, since the rows may describe
    /// detections against a dataset loaded elsewhere.
    pub fn detections_from_rows(rows: &[f64]) -> Result<Vec<Annotation>, Error> {
        if rows.len() % 7 != 0 {
            return Err(Error::Validation(format!(
                "detection rows must be flat 7-tuples, got {} values",
                rows.len()
            )));
        }
        Ok(rows
            .chunks_exact(7)
            .enumerate()
            .map(|(i, row)| Annotation {
                id: (i + 1) as u64,
                image_id: row[0] as u64,
                category_id: row[6] as u64,
                bbox: Some([row[1], row[2], row[3], row[4]]),
                area: None,
                segmentation: None,
                iscrowd: false,
                score: Some(row[5]),
            })
            .collect())
    }
}

fn resolve_segmentation(seg: &Segmentation, h: u32, w: u32) -> Result<Rle, Error> {
    match seg {
        Segmentation::Polygon(rings) => mask::from_polygons(rings, h, w),
        Segmentation::CompressedRle { size, counts } => {
            Ok(mask::rle_from_string(counts, size[0], size[1]))
        }
        Segmentation::UncompressedRle { size, counts } => Ok(Rle {
            h: size[0],
            w: size[1],
            counts: counts.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(id: u64, image_id: u64, category_id: u64, bbox: [f64; 4], area: f64) -> Annotation {
        Annotation {
            id,
            image_id,
            category_id,
            bbox: Some(bbox),
            area: Some(area),
            segmentation: None,
            iscrowd: false,
            score: None,
        }
    }

    fn test_dataset() -> Dataset {
        Dataset {
            info: None,
            images: vec![
                Image {
                    id: 1,
                    file_name: "image1.jpg".into(),
                    width: 800,
                    height: 600,
                    license: None,
                    date_captured: None,
                },
                Image {
                    id: 2,
                    file_name: "image2.jpg".into(),
                    width: 1024,
                    height: 768,
                    license: None,
                    date_captured: None,
                },
            ],
            annotations: vec![
                ann(1, 1, 1, [100.0, 100.0, 200.0, 200.0], 40_000.0),
                ann(2, 2, 2, [200.0, 200.0, 300.0, 300.0], 60_000.0),
                Annotation {
                    iscrowd: true,
                    ..ann(3, 2, 2, [1.0, 2.0, 3.0, 4.0], 12.0)
                },
            ],
            categories: vec![
                Category {
                    id: 1,
                    name: "cat".into(),
                    supercategory: Some("animal".into()),
                },
                Category {
                    id: 2,
                    name: "dog".into(),
                    supercategory: Some("animal".into()),
                },
            ],
            licenses: vec![],
        }
    }

    fn indexed_store() -> AnnotationStore {
        let mut store = AnnotationStore::from_dataset(test_dataset()).unwrap();
        store.create_index();
        store
    }

    #[test]
    fn queries_require_index() {
        let store = AnnotationStore::from_dataset(test_dataset()).unwrap();
        assert!(!store.is_indexed());
        assert!(matches!(
            store.ann_ids(&[], &[], None, None),
            Err(Error::NotIndexed)
        ));
        assert!(matches!(store.load_imgs(&[1]), Err(Error::NotIndexed)));
    }

    #[test]
    fn rejects_dangling_image_reference() {
        let mut dataset = test_dataset();
        dataset.annotations.push(ann(4, 99, 1, [0.0, 0.0, 1.0, 1.0], 1.0));
        assert!(matches!(
            AnnotationStore::from_dataset(dataset),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn rejects_dangling_category_reference() {
        let mut dataset = test_dataset();
        dataset.annotations.push(ann(4, 1, 99, [0.0, 0.0, 1.0, 1.0], 1.0));
        assert!(matches!(
            AnnotationStore::from_dataset(dataset),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn rejects_crowd_with_polygon_segmentation() {
        let mut dataset = test_dataset();
        dataset.annotations[2].segmentation = Some(Segmentation::Polygon(vec![vec![
            0.0, 0.0, 4.0, 0.0, 4.0, 4.0,
        ]]));
        assert!(matches!(
            AnnotationStore::from_dataset(dataset),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn reindexing_is_idempotent() {
        let mut store = indexed_store();
        let first = store.index.clone();
        store.create_index();
        assert_eq!(store.index, first);
    }

    #[test]
    fn ann_ids_compound_filters() {
        let store = indexed_store();
        assert_eq!(store.ann_ids(&[1], &[1], None, None).unwrap(), vec![1]);
        assert_eq!(store.ann_ids(&[], &[], None, None).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            store.ann_ids(&[], &[], Some([0.0, 40_001.0]), None).unwrap(),
            vec![1, 3]
        );
        assert_eq!(store.ann_ids(&[], &[], None, Some(true)).unwrap(), vec![3]);
        assert_eq!(
            store.ann_ids(&[], &[], None, Some(false)).unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn ann_ids_follow_image_listing_order() {
        let store = indexed_store();
        // Image 2's annotations come first because image 2 is listed first;
        // filtering never re-sorts.
        assert_eq!(store.ann_ids(&[2, 1], &[], None, None).unwrap(), vec![2, 3, 1]);
        assert_eq!(
            store
                .ann_ids(&[2, 1], &[], Some([0.0, 50_000.0]), None)
                .unwrap(),
            vec![3, 1]
        );
    }

    #[test]
    fn area_range_is_inclusive() {
        let store = indexed_store();
        assert_eq!(
            store.ann_ids(&[], &[], Some([12.0, 40_000.0]), None).unwrap(),
            vec![1, 3]
        );
    }

    #[test]
    fn cat_ids_filters() {
        let store = indexed_store();
        assert_eq!(store.cat_ids(&["cat"], &[], &[]).unwrap(), vec![1]);
        assert_eq!(store.cat_ids(&[], &["animal"], &[]).unwrap(), vec![1, 2]);
        assert_eq!(store.cat_ids(&["dog"], &["animal"], &[2]).unwrap(), vec![2]);
        assert_eq!(store.cat_ids(&["dog"], &[], &[1]).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn img_ids_intersects_categories() {
        let store = indexed_store();
        assert_eq!(store.img_ids(&[1], &[1]).unwrap(), vec![1]);
        assert_eq!(store.img_ids(&[], &[]).unwrap(), vec![1, 2]);
        assert_eq!(store.img_ids(&[], &[2]).unwrap(), vec![2]);
        assert_eq!(store.img_ids(&[2, 1], &[1]).unwrap(), vec![1]);
    }

    #[test]
    fn load_entities_in_requested_order() {
        let store = indexed_store();
        let anns = store.load_anns(&[2, 1]).unwrap();
        assert_eq!(anns[0].id, 2);
        assert_eq!(anns[1].id, 1);
        assert_eq!(store.load_cats(&[2]).unwrap()[0].name, "dog");
        assert_eq!(store.load_imgs(&[2, 2]).unwrap().len(), 2);
    }

    #[test]
    fn load_is_all_or_nothing() {
        let store = indexed_store();
        assert!(matches!(
            store.load_anns(&[1, 42]),
            Err(Error::AnnotationNotFound(42))
        ));
        assert!(matches!(store.load_imgs(&[7]), Err(Error::ImageNotFound(7))));
        assert!(matches!(
            store.load_cats(&[3]),
            Err(Error::CategoryNotFound(3))
        ));
    }

    #[test]
    fn ann_to_rle_from_bbox() {
        let store = indexed_store();
        let anns = store.load_anns(&[1]).unwrap();
        let rle = store.ann_to_rle(anns[0]).unwrap();
        assert_eq!((rle.h, rle.w), (600, 800));
        assert_eq!(mask::area(&rle), 40_000);
        assert_eq!(mask::to_bbox(&rle), [100.0, 100.0, 200.0, 200.0]);
    }

    #[test]
    fn ann_to_mask_counts_match_area() {
        let store = indexed_store();
        let anns = store.load_anns(&[3]).unwrap();
        let mask = store.ann_to_mask(anns[0]).unwrap();
        assert_eq!(mask.iter().filter(|&&p| p != 0).count(), 12);
    }

    #[test]
    fn detections_from_rows_assigns_sequential_ids() {
        let rows = [
            1.0, 100.0, 200.0, 50.0, 50.0, 0.9, 1.0, //
            2.0, 150.0, 250.0, 70.0, 60.0, 0.8, 2.0,
        ];
        let anns = AnnotationStore::detections_from_rows(&rows).unwrap();
        assert_eq!(anns.len(), 2);
        assert_eq!(anns[0].id, 1);
        assert_eq!(anns[0].image_id, 1);
        assert_eq!(anns[0].bbox, Some([100.0, 200.0, 50.0, 50.0]));
        assert_eq!(anns[0].score, Some(0.9));
        assert_eq!(anns[0].category_id, 1);
        assert_eq!(anns[1].id, 2);
        assert_eq!(anns[1].image_id, 2);
        assert_eq!(anns[1].bbox, Some([150.0, 250.0, 70.0, 60.0]));
        assert_eq!(anns[1].score, Some(0.8));
        assert_eq!(anns[1].category_id, 2);
    }

    #[test]
    fn detections_from_rows_rejects_ragged_input() {
        assert!(matches!(
            AnnotationStore::detections_from_rows(&[1.0, 2.0, 3.0]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn results_store_derives_area_and_ids() {
        let store = indexed_store();
        let detections = AnnotationStore::detections_from_rows(&[
            1.0, 10.0, 10.0, 20.0, 30.0, 0.75, 1.0, //
            2.0, 5.0, 5.0, 10.0, 10.0, 0.5, 2.0,
        ])
        .unwrap();
        let results = store.results_from_annotations(detections).unwrap();
        assert!(results.is_indexed());
        let anns = results.load_anns(&[1, 2]).unwrap();
        assert_eq!(anns[0].area, Some(600.0));
        assert_eq!(anns[1].area, Some(100.0));
        assert!(anns.iter().all(|a| !a.iscrowd));
        assert!(anns.iter().all(|a| a.segmentation.is_some()));
    }

    #[test]
    fn results_reject_unknown_image() {
        let store = indexed_store();
        let detections =
            AnnotationStore::detections_from_rows(&[9.0, 0.0, 0.0, 1.0, 1.0, 0.1, 1.0]).unwrap();
        assert!(matches!(
            store.results_from_annotations(detections),
            Err(Error::Validation(_))
        ));
    }
}
