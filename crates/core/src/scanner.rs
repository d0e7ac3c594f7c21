use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::BagMetadata;

/// Category subdirectories a bag tree must contain, in scan order.
pub const MAP_CATEGORIES: [&str; 5] = [
    "skidpad",
    "trackdrive",
    "autox",
    "acceleration",
    "undefined",
];

const BAG_EXTENSIONS: [&str; 2] = ["db3", "mcap"];
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

// rosbag2 metadata.yaml model (serde)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
pub struct Rosbag2Metadata {
    rosbag2_bagfile_information: BagfileInformation,
}

#[derive(Deserialize, Debug)]
struct BagfileInformation {
    duration: NanosecondSpan,
    starting_time: EpochStart,
    message_count: i64,
    topics_with_message_count: Vec<TopicWithCount>,
}

#[derive(Deserialize, Debug)]
struct NanosecondSpan {
    nanoseconds: i64,
}

#[derive(Deserialize, Debug)]
struct EpochStart {
    nanoseconds_since_epoch: i64,
}

#[derive(Deserialize, Debug)]
struct TopicWithCount {
    topic_metadata: TopicMetadata,
    message_count: i64,
}

#[derive(Deserialize, Debug, Clone)]
struct TopicMetadata {
    name: String,
    #[serde(rename = "type")]
    message_type: String,
}

/// One topic of a bag as stored in `topics_json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TopicSummary {
    pub name: String,
    pub message_type: String,
    pub message_count: i64,
}

pub fn parse_rosbag2_yaml(raw: &str) -> Result<Rosbag2Metadata> {
    serde_yaml::from_str(raw).context("failed to parse rosbag2 metadata YAML")
}

/// Flatten a topic name into a column-safe identifier: `/vehicle/odom`
/// becomes `_vehicle_odom`.
pub fn sanitize_topic_name(name: &str) -> String {
    name.replace('/', "_")
}

/// Infer the map category from a bag path by looking for a known category
/// name among its components. Unknown layouts map to `undefined`.
pub fn determine_map_category(path: &Path) -> String {
    for component in path.components() {
        let part = component.as_os_str().to_string_lossy();
        if MAP_CATEGORIES.contains(&part.as_ref()) {
            return part.into_owned();
        }
    }
    "undefined".to_string()
}

fn is_bag_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| BAG_EXTENSIONS.contains(&ext))
}

fn format_epoch_ns(nanoseconds: i64) -> Result<String> {
    let seconds = nanoseconds.div_euclid(1_000_000_000);
    let subsec = nanoseconds.rem_euclid(1_000_000_000) as u32;
    let timestamp = DateTime::from_timestamp(seconds, subsec)
        .ok_or_else(|| anyhow!("timestamp out of range: {nanoseconds}ns"))?;
    Ok(timestamp.format(TIMESTAMP_FORMAT).to_string())
}

/// Parse one bag directory: exactly one `.db3` or `.mcap` file plus the
/// rosbag2 `metadata.yaml` sidecar.
pub fn parse_bag_dir(bag_dir: &Path) -> Result<BagMetadata> {
    if !bag_dir.is_dir() {
        bail!("bag directory does not exist: {}", bag_dir.display());
    }

    let mut bag_files: Vec<PathBuf> = Vec::new();
    let entries = fs::read_dir(bag_dir)
        .with_context(|| format!("failed to read bag directory: {}", bag_dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && is_bag_file(&path) {
            bag_files.push(path);
        }
    }

    let bag_file = match bag_files.as_slice() {
        [] => bail!("no bag files found in directory: {}", bag_dir.display()),
        [single] => single.clone(),
        _ => bail!(
            "multiple bag files found in directory: {}",
            bag_dir.display()
        ),
    };

    let file_name = bag_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_type = bag_file
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default();
    let size_mb = fs::metadata(&bag_file)
        .with_context(|| format!("failed to stat bag file: {}", bag_file.display()))?
        .len() as f64
        / (1024.0 * 1024.0);

    let yaml_path = bag_dir.join("metadata.yaml");
    if !yaml_path.exists() {
        bail!(
            "bag directory is missing metadata.yaml: {}",
            bag_dir.display()
        );
    }
    let raw = fs::read_to_string(&yaml_path)
        .with_context(|| format!("failed to read {}", yaml_path.display()))?;
    let info = parse_rosbag2_yaml(&raw)?.rosbag2_bagfile_information;

    let start_ns = info.starting_time.nanoseconds_since_epoch;
    let duration_ns = info.duration.nanoseconds;
    let start_time = format_epoch_ns(start_ns)?;
    let end_time = format_epoch_ns(start_ns + duration_ns)?;

    let topics: Vec<TopicSummary> = info
        .topics_with_message_count
        .iter()
        .map(|entry| TopicSummary {
            name: entry.topic_metadata.name.clone(),
            message_type: entry.topic_metadata.message_type.clone(),
            message_count: entry.message_count,
        })
        .collect();

    let mut additional_metadata = serde_json::Map::new();
    for topic in &topics {
        let key = format!("topic_{}_count", sanitize_topic_name(&topic.name));
        additional_metadata.insert(key, serde_json::json!(topic.message_count));
    }

    debug!(
        bag = %bag_file.display(),
        topics = topics.len(),
        messages = info.message_count,
        "parsed bag metadata"
    );

    Ok(BagMetadata {
        file_path: bag_file.to_string_lossy().into_owned(),
        file_name,
        file_type,
        map_category: determine_map_category(bag_dir),
        start_time,
        end_time,
        duration: duration_ns as f64 / 1e9,
        size_mb,
        message_count: info.message_count,
        topic_count: topics.len() as i64,
        topics_json: serde_json::to_string(&topics)
            .context("failed to serialize topic summaries")?,
        metadata_json: serde_json::to_string(&additional_metadata)
            .context("failed to serialize additional metadata")?,
    })
}

/// Scan a category-structured bag tree. The root must contain every
/// directory named in [`MAP_CATEGORIES`]; each is walked recursively and a
/// directory holding a bag file is treated as one bag. Unreadable bags are
/// skipped with a warning so a single corrupt recording does not abort the
/// whole ingest.
pub fn scan_root(root: &Path) -> Result<Vec<BagMetadata>> {
    if !root.is_dir() {
        bail!("bag root directory does not exist: {}", root.display());
    }

    for category in MAP_CATEGORIES {
        if !root.join(category).is_dir() {
            bail!(
                "bag tree layout is incorrect, expected: {}/{category}",
                root.display()
            );
        }
    }

    let mut bags = Vec::new();
    for category in MAP_CATEGORIES {
        collect_bags_under(&root.join(category), category, &mut bags)?;
    }
    Ok(bags)
}

fn collect_bags_under(dir: &Path, category: &str, out: &mut Vec<BagMetadata>) -> Result<()> {
    let mut has_bag_file = false;
    let mut subdirs = Vec::new();

    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if is_bag_file(&path) {
            has_bag_file = true;
        }
    }

    if has_bag_file {
        match parse_bag_dir(dir) {
            Ok(mut metadata) => {
                metadata.map_category = category.to_string();
                out.push(metadata);
            }
            Err(error) => {
                warn!(
                    dir = %dir.display(),
                    error = format!("{error:#}"),
                    "skipping unreadable bag directory"
                );
            }
        }
        return Ok(());
    }

    for subdir in subdirs {
        collect_bags_under(&subdir, category, out)?;
    }
    Ok(())
}
