use serde::{Deserialize, Deserializer, Serialize};

/// Top-level dataset description: `info`, `images`, `annotations`,
/// `categories`, plus an optional `licenses` list. Every section is optional
/// in the serialized form so partial files (e.g. detection results) parse.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Dataset {
    #[serde(default)]
    pub info: Option<Info>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub licenses: Vec<License>,
}

/// Free-form dataset metadata; ignored by the core logic.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Info {
    #[serde(default)]
    pub year: Option<u32>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contributor: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub date_created: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Image {
    pub id: u64,
    #[serde(default)]
    pub file_name: String,
    pub height: u32,
    pub width: u32,
    #[serde(default)]
    pub license: Option<u64>,
    #[serde(default)]
    pub date_captured: Option<String>,
}

/// A single object annotation. Ground-truth annotations carry `area` and a
/// segmentation; detection results additionally carry a `score`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Annotation {
    #[serde(default)]
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    /// `[x, y, w, h]` in pixel coordinates.
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub segmentation: Option<Segmentation>,
    #[serde(default, deserialize_with = "deserialize_iscrowd")]
    pub iscrowd: bool,
    /// Detection confidence (result annotations only).
    #[serde(default)]
    pub score: Option<f64>,
}

// Serialized datasets store iscrowd as 0/1; tolerate bools as well.
fn deserialize_iscrowd<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IsCrowd {
        Bool(bool),
        Int(u8),
    }
    match IsCrowd::deserialize(deserializer)? {
        IsCrowd::Bool(b) => Ok(b),
        IsCrowd::Int(i) => Ok(i != 0),
    }
}

/// The segmentation variants an annotation may carry. Crowd annotations use
/// an RLE form; instance annotations use polygons. The representations are
/// never compared directly; [`crate::store::AnnotationStore::ann_to_rle`]
/// normalizes either into an [`Rle`] first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    /// One or more rings, each a flat `[x0, y0, x1, y1, ...]` vertex list.
    Polygon(Vec<Vec<f64>>),
    /// `{size: [h, w], counts: "..."}` with string-packed counts.
    CompressedRle { size: [u32; 2], counts: String },
    /// `{size: [h, w], counts: [...]}` with literal counts.
    UncompressedRle { size: [u32; 2], counts: Vec<u32> },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Category {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub supercategory: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct License {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Run-length encoded binary mask.
///
/// Counts alternate between background and foreground runs, starting with a
/// background run (possibly zero-length), and traverse the mask in
/// column-major order: pixel (x, y) sits at offset `y + h * x`. A well-formed
/// RLE satisfies `counts.sum() == h * w`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rle {
    pub h: u32,
    pub w: u32,
    pub counts: Vec<u32>,
}

impl Rle {
    /// The all-background mask of the given dimensions.
    pub fn empty(h: u32, w: u32) -> Self {
        Rle {
            h,
            w,
            counts: vec![h * w],
        }
    }

    /// Total pixel count, `h * w`.
    pub fn len(&self) -> u64 {
        u64::from(self.h) * u64::from(self.w)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
