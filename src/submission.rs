//! Detection-result to submission-text conversion.
//!
//! Input is `all_boxes[class][image]`, each entry a list of
//! `[xmin, ymin, xmax, ymax, confidence]` rows. Output is one line per row:
//! `image_index class_id confidence xmin ymin xmax ymax`, with 1-based image
//! indices and class 0 (background) left out.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_OUTPUT: &str = "detections_submission.txt";

/// Detections indexed by class, then image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Detections {
    pub all_boxes: Vec<Vec<Vec<Vec<f64>>>>,
}

impl Detections {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read detections: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse detections: {}", path.display()))
    }

    pub fn num_classes(&self) -> usize {
        self.all_boxes.len()
    }

    pub fn num_images(&self) -> usize {
        self.all_boxes.first().map(Vec::len).unwrap_or(0)
    }
}

/// Write submission lines in `(class, image, row)` order; returns the line count.
pub fn write_submission<W: Write>(detections: &Detections, mut out: W) -> Result<usize> {
    let mut lines = 0;
    for (class_id, per_image) in detections.all_boxes.iter().enumerate().skip(1) {
        for (image, rows) in per_image.iter().enumerate() {
            for row in rows {
                if row.len() < 5 {
                    bail!(
                        "class {} image {} has a row with {} values, expected at least 5",
                        class_id,
                        image,
                        row.len()
                    );
                }
                let confidence = row[row.len() - 1];
                writeln!(
                    out,
                    "{} {} {:.6} {:.6} {:.6} {:.6} {:.6}",
                    image + 1,
                    class_id,
                    confidence,
                    row[0],
                    row[1],
                    row[2],
                    row[3]
                )
                .context("Failed to write submission line")?;
                lines += 1;
            }
        }
    }
    Ok(lines)
}

/// Convert a detections file into a submission file.
pub fn convert_file(input: &Path, output: &Path) -> Result<usize> {
    info!(path = %input.display(), "loading detection result");
    let detections = Detections::load(input)?;
    info!(
        num_classes = detections.num_classes(),
        num_images = detections.num_images(),
        "loaded detections"
    );

    let mut buf = Vec::new();
    let lines = write_submission(&detections, &mut buf)?;
    std::fs::write(output, buf)
        .with_context(|| format!("Failed to write submission: {}", output.display()))?;
    info!(path = %output.display(), lines, "wrote detection result");
    Ok(lines)
}
