//! Datasets to train the classifier on
//!
//! Small synthetic two class problems in the plane, plus a reader for the IDX files in
//! which MNIST and Fashion-MNIST are distributed. Labels are zero-based class indices.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
    fs,
    path::Path,
};

use clap::ValueEnum;
use rand::Rng;
use thiserror::Error;

/// Inputs and their class indices
pub type Samples = (Vec<Vec<f32>>, Vec<usize>);

/// Errors when reading a dataset from disk
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Bad IDX magic number: expected {expected:#010x}, got {got:#010x}")]
    BadMagic { expected: u32, got: u32 },
    #[error("IDX file is truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },
}

/// Toggles between synthetic dataset types
#[derive(Debug, ValueEnum, Clone, Copy)]
pub enum Dataset {
    Line,
    Circle,
    XOR,
    Moon,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::XOR => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
        }
    }
}

impl Dataset {
    /// Every synthetic dataset is a two class problem
    pub fn n_classes(&self) -> usize {
        2
    }

    /// Every synthetic dataset lives in the plane
    pub fn input_size(&self) -> usize {
        2
    }
}

/// Generates a dataset based on the dataset type
pub fn load_dataset<R: Rng + ?Sized>(dataset: Dataset, class_size: usize, rng: &mut R) -> Samples {
    match dataset {
        Dataset::Line => gen_linear_data(class_size, rng),
        Dataset::Circle => gen_circle_data(class_size, rng),
        Dataset::XOR => gen_xor_data(class_size, rng),
        Dataset::Moon => gen_moon_data(class_size, rng),
    }
}

/// Generates a simple linearly separable dataset
pub fn gen_linear_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(if x > y { 0 } else { 1 });
    }

    (data, labels)
}

/// Generates a binary classification dataset of two concentric circles
pub fn gen_circle_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let radii = [3.0, 5.0];

    let mut data = Vec::new();
    let mut labels = Vec::new();

    for (class, radius) in radii.into_iter().enumerate() {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let radius_delta = radius * rng.random_range(-0.25..0.25);
            let x = (radius + radius_delta) * angle.cos();
            let y = (radius + radius_delta) * angle.sin();
            data.push(vec![x, y]);
            labels.push(class);
        }
    }

    (data, labels)
}

/// Generates points labelled by whether their coordinates share a sign
pub fn gen_xor_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(if x * y > 0.0 { 0 } else { 1 });
    }

    (data, labels)
}

/// Generates a moons dataset (two interleaving partial circles) for binary classification
pub fn gen_moon_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let radius = 3.0;
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for class in 0..2 {
        for _ in 0..class_size {
            let theta: f32 = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
            let (x, y) = if class == 0 {
                (radius * theta.cos(), radius * theta.sin())
            } else {
                (radius * theta.cos() + 2.0, -radius * theta.sin() - 0.2)
            };
            let noise_x = rng.random_range(-0.1..0.1);
            let noise_y = rng.random_range(-0.1..0.1);
            data.push(vec![x + noise_x, y + noise_y]);
            labels.push(class);
        }
    }

    (data, labels)
}

/// Which half of an IDX dataset to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_prefix(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }
}

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

/// Reads an MNIST style dataset from `dir`, e.g. `train-images-idx3-ubyte` and
/// `train-labels-idx1-ubyte` for the training split. Images are flattened and
/// normalized to `[-1, 1]`. `limit` keeps only the first examples.
pub fn load_idx(dir: &Path, split: Split, limit: Option<usize>) -> Result<Samples, DatasetError> {
    let prefix = split.file_prefix();
    let images_path = dir.join(format!("{prefix}-images-idx3-ubyte"));
    let labels_path = dir.join(format!("{prefix}-labels-idx1-ubyte"));

    let mut images = parse_idx_images(&fs::read(&images_path)?)?;
    let mut labels = parse_idx_labels(&fs::read(&labels_path)?)?;
    if images.len() != labels.len() {
        return Err(DatasetError::CountMismatch {
            images: images.len(),
            labels: labels.len(),
        });
    }
    if let Some(limit) = limit {
        images.truncate(limit);
        labels.truncate(limit);
    }
    log::info!(
        "Loaded {} {:?} examples from '{}'.",
        images.len(),
        split,
        dir.display()
    );
    Ok((images, labels))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, DatasetError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DatasetError::Truncated {
            expected: offset + 4,
            got: bytes.len(),
        })
}

fn check_magic(bytes: &[u8], expected: u32) -> Result<(), DatasetError> {
    let got = read_u32(bytes, 0)?;
    if got != expected {
        return Err(DatasetError::BadMagic { expected, got });
    }
    Ok(())
}

/// Parses an IDX3 image file into flattened images scaled with mean 0.5 and std 0.5
pub fn parse_idx_images(bytes: &[u8]) -> Result<Vec<Vec<f32>>, DatasetError> {
    check_magic(bytes, IDX_IMAGES_MAGIC)?;
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    // a header claiming more pixels than fit in memory can never be satisfied by the file
    let expected = rows
        .checked_mul(cols)
        .and_then(|image_size| count.checked_mul(image_size))
        .and_then(|n_pixels| n_pixels.checked_add(16))
        .ok_or(DatasetError::Truncated {
            expected: usize::MAX,
            got: bytes.len(),
        })?;
    let image_size = rows * cols;

    let pixels = &bytes[16..];
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            expected,
            got: bytes.len(),
        });
    }
    if image_size == 0 {
        return Ok(vec![Vec::new(); count]);
    }
    Ok(pixels
        .chunks_exact(image_size)
        .take(count)
        .map(|image| {
            image
                .iter()
                .map(|&p| (p as f32 / 255.0 - 0.5) / 0.5)
                .collect()
        })
        .collect())
}

/// Parses an IDX1 label file
pub fn parse_idx_labels(bytes: &[u8]) -> Result<Vec<usize>, DatasetError> {
    check_magic(bytes, IDX_LABELS_MAGIC)?;
    let count = read_u32(bytes, 4)? as usize;
    let expected = 8 + count;
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            expected,
            got: bytes.len(),
        });
    }
    Ok(bytes[8..expected].iter().map(|&l| l as usize).collect())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn idx_images(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IDX_IMAGES_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_synthetic_datasets() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for dataset in [Dataset::Line, Dataset::Circle, Dataset::XOR, Dataset::Moon] {
            let (data, labels) = load_dataset(dataset, 50, &mut rng);
            assert_eq!(data.len(), labels.len());
            assert!(data.iter().all(|d| d.len() == dataset.input_size()));
            assert!(labels.iter().all(|&l| l < dataset.n_classes()));
            assert!(labels.contains(&0) && labels.contains(&1), "{dataset}");
        }
    }

    #[test]
    fn test_parse_idx() {
        let images = parse_idx_images(&idx_images(2, 2, 2, &[0, 255, 0, 255, 255, 255, 0, 0])).unwrap();
        assert_eq!(
            images,
            vec![vec![-1.0, 1.0, -1.0, 1.0], vec![1.0, 1.0, -1.0, -1.0]]
        );
        assert_eq!(parse_idx_labels(&idx_labels(&[7, 2])).unwrap(), vec![7, 2]);
    }

    #[test]
    fn test_parse_idx_errors() {
        assert!(matches!(
            parse_idx_images(&idx_labels(&[1])),
            Err(DatasetError::BadMagic {
                expected: IDX_IMAGES_MAGIC,
                got: IDX_LABELS_MAGIC
            })
        ));
        assert!(matches!(
            parse_idx_images(&idx_images(2, 2, 2, &[0; 5])),
            Err(DatasetError::Truncated {
                expected: 24,
                got: 21
            })
        ));
        assert!(matches!(
            parse_idx_labels(&[0, 0]),
            Err(DatasetError::Truncated { .. })
        ));
    }

    #[test]
    fn test_parse_idx_oversized_header() {
        let header = idx_images(u32::MAX, u32::MAX, u32::MAX, &[0; 8]);
        assert!(matches!(
            parse_idx_images(&header),
            Err(DatasetError::Truncated {
                expected: usize::MAX,
                got: 24
            })
        ));

        let header = idx_images(2, 1 << 20, 1 << 20, &[]);
        assert!(matches!(
            parse_idx_images(&header),
            Err(DatasetError::Truncated { got: 16, .. })
        ));
    }

    #[test]
    fn test_load_idx() {
        let dir = std::env::temp_dir().join(format!("fc-net-idx-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("t10k-images-idx3-ubyte"),
            idx_images(3, 1, 2, &[0, 0, 255, 255, 0, 255]),
        )
        .unwrap();
        fs::write(dir.join("t10k-labels-idx1-ubyte"), idx_labels(&[0, 1, 2])).unwrap();

        let (data, labels) = load_idx(&dir, Split::Test, Some(2)).unwrap();
        assert_eq!(data, vec![vec![-1.0, -1.0], vec![1.0, 1.0]]);
        assert_eq!(labels, vec![0, 1]);

        let err = load_idx(&dir, Split::Train, None).unwrap_err();
        assert!(matches!(err, DatasetError::Io(_)));
        fs::remove_dir_all(&dir).unwrap();
    }
}
