//! Startup provisioning of block devices.
//!
//! Devices are enumerated with `lsblk --json`, classified by transport and
//! rotation, and then either mounted under `<physical_root>/<class>/<serial>`,
//! formatted and mounted, or left alone when excluded. The result is a list
//! of registration inputs for the [`DriveRegistry`](super::DriveRegistry).

use super::types::{Drive, Tier};
use crate::command::{args, CommandRunner};
use crate::config::TieringConfig;
use crate::{Result, TierError};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const LSBLK_COLUMNS: &str = "PATH,SERIAL,ROTA,TRAN,SIZE,TYPE,FSTYPE,MOUNTPOINT";

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(rename = "blockdevices", default)]
    block_devices: Vec<BlockDevice>,
}

/// One `lsblk` disk entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub rota: bool,
    #[serde(default)]
    pub tran: Option<String>,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub size: Option<u64>,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub children: Vec<Partition>,
}

/// A partition of a [`BlockDevice`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Partition {
    pub path: PathBuf,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
}

/// Hardware class, which also names the mount directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveClass {
    Nvme,
    Ssd,
    Hdd,
}

impl DriveClass {
    pub fn classify(device: &BlockDevice) -> Self {
        if device.rota {
            DriveClass::Hdd
        } else if device.tran.as_deref() == Some("nvme") {
            DriveClass::Nvme
        } else {
            DriveClass::Ssd
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            DriveClass::Nvme => Tier::Fast,
            DriveClass::Ssd => Tier::Slow,
            DriveClass::Hdd => Tier::Archival,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriveClass::Nvme => "nvme",
            DriveClass::Ssd => "ssd",
            DriveClass::Hdd => "hdd",
        }
    }
}

/// What provisioning does with one device.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionAction {
    Exclude {
        device: BlockDevice,
        reason: String,
    },
    Mount {
        device: BlockDevice,
        class: DriveClass,
        partition: Partition,
        mount_path: PathBuf,
    },
    Format {
        device: BlockDevice,
        class: DriveClass,
        mount_path: PathBuf,
    },
}

/// Parse `lsblk --json` output, keeping only whole disks.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| TierError::Json {
        message: format!("Failed to parse lsblk output: {}", e),
        source: Some(e),
    })?;
    Ok(output
        .block_devices
        .into_iter()
        .filter(|d| d.device_type == "disk")
        .collect())
}

/// Discovers, formats and mounts drives.
pub struct Provisioner {
    runner: CommandRunner,
    physical_root: PathBuf,
    filesystem: String,
    exclude_drives: Vec<String>,
}

impl Provisioner {
    pub fn new(runner: CommandRunner, config: &TieringConfig) -> Self {
        Self {
            runner,
            physical_root: config.physical_root.clone(),
            filesystem: config.filesystem.clone(),
            exclude_drives: config.exclude_drives.clone(),
        }
    }

    /// Enumerate disks with `lsblk`.
    pub async fn discover(&self) -> Result<Vec<BlockDevice>> {
        let output = self
            .runner
            .query("lsblk", &args(["--json", "--bytes", "-o", LSBLK_COLUMNS]))
            .await?;
        parse_lsblk(&output.stdout)
    }

    /// Decide what to do with each device. Pure; runs no commands.
    pub fn plan(&self, devices: &[BlockDevice]) -> Vec<ProvisionAction> {
        devices.iter().map(|d| self.plan_device(d)).collect()
    }

    fn plan_device(&self, device: &BlockDevice) -> ProvisionAction {
        let serial = match device.serial.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(serial) => serial.trim().to_string(),
            None => {
                return ProvisionAction::Exclude {
                    device: device.clone(),
                    reason: "no serial number".to_string(),
                }
            }
        };
        if self.exclude_drives.iter().any(|s| s == &serial) {
            return ProvisionAction::Exclude {
                device: device.clone(),
                reason: "listed in exclude_drives".to_string(),
            };
        }

        let class = DriveClass::classify(device);
        let mount_path = self.physical_root.join(class.as_str()).join(&serial);

        match device.children.as_slice() {
            [partition]
                if partition
                    .fstype
                    .as_deref()
                    .is_some_and(|fs| fs.eq_ignore_ascii_case(&self.filesystem)) =>
            {
                ProvisionAction::Mount {
                    device: device.clone(),
                    class,
                    partition: partition.clone(),
                    mount_path,
                }
            }
            _ => ProvisionAction::Format {
                device: device.clone(),
                class,
                mount_path,
            },
        }
    }

    /// Carry out one action, returning the registration input.
    pub async fn execute(&self, action: &ProvisionAction) -> Result<Option<Drive>> {
        match action {
            ProvisionAction::Exclude { device, reason } => {
                info!("{} excluded: {}", device.path.display(), reason);
                Ok(None)
            }
            ProvisionAction::Mount {
                device,
                class,
                partition,
                mount_path,
            } => {
                info!("{} to be mounted as {}", device.path.display(), class.as_str());
                self.mount(partition, mount_path).await?;
                Ok(Some(self.registration(device, *class, mount_path)))
            }
            ProvisionAction::Format {
                device,
                class,
                mount_path,
            } => {
                info!("{} to be formatted as {}", device.path.display(), class.as_str());
                let partition = self.format(device).await?;
                self.mount(&partition, mount_path).await?;
                Ok(Some(self.registration(device, *class, mount_path)))
            }
        }
    }

    /// Discover, plan and execute; a failing device is skipped.
    pub async fn provision_all(&self) -> Result<Vec<Drive>> {
        let devices = self.discover().await?;
        let mut drives = Vec::new();
        for action in self.plan(&devices) {
            match self.execute(&action).await {
                Ok(Some(drive)) => drives.push(drive),
                Ok(None) => {}
                Err(e) => warn!("Provisioning failed, skipping device: {}", e),
            }
        }
        Ok(drives)
    }

    async fn mount(&self, partition: &Partition, mount_path: &Path) -> Result<()> {
        if partition.mountpoint.as_deref() == Some(mount_path) {
            return Ok(());
        }
        if !self.runner.is_dry_run() {
            std::fs::create_dir_all(mount_path)
                .map_err(|e| TierError::io_with_path(e, mount_path))?;
        }
        let part = partition.path.to_string_lossy().to_string();
        let target = mount_path.to_string_lossy().to_string();
        self.runner.run("mount", &[part, target]).await?;
        Ok(())
    }

    async fn format(&self, device: &BlockDevice) -> Result<Partition> {
        let dev = device.path.to_string_lossy().to_string();
        for partition in &device.children {
            let part = partition.path.to_string_lossy().to_string();
            if let Err(e) = self.runner.run("umount", &args(["-l", &part])).await {
                warn!("Lazy unmount of {} failed: {}", part, e);
            }
        }

        self.runner
            .run("wipefs", &args(["--all", "--force", &dev]))
            .await?;
        self.runner
            .run(
                "parted",
                &args([
                    "-s",
                    "-a",
                    "optimal",
                    &dev,
                    "mklabel",
                    "gpt",
                    "mkpart",
                    "primary",
                    &self.filesystem,
                    "0%",
                    "100%",
                ]),
            )
            .await?;

        let partition = self.first_partition(device).await?;
        let part = partition.path.to_string_lossy().to_string();
        let fs = self.filesystem.to_lowercase();
        self.runner.run("mkfs", &args(["-t", &fs, &part])).await?;

        Ok(Partition {
            fstype: Some(fs),
            mountpoint: None,
            ..partition
        })
    }

    /// The partition `parted` just created, read back from `lsblk`.
    async fn first_partition(&self, device: &BlockDevice) -> Result<Partition> {
        if self.runner.is_dry_run() {
            return Ok(Partition {
                path: predicted_partition_path(&device.path),
                fstype: None,
                mountpoint: None,
            });
        }
        let dev = device.path.to_string_lossy().to_string();
        let output = self
            .runner
            .query("lsblk", &args(["--json", "--bytes", "-o", LSBLK_COLUMNS, &dev]))
            .await?;
        parse_lsblk(&output.stdout)?
            .into_iter()
            .next()
            .and_then(|d| d.children.into_iter().next())
            .ok_or_else(|| TierError::Command {
                command: format!("lsblk {}", dev),
                message: "no partition after partitioning".to_string(),
            })
    }

    fn registration(&self, device: &BlockDevice, class: DriveClass, mount_path: &Path) -> Drive {
        let serial = device.serial.clone().unwrap_or_default();
        let mut drive = Drive::new(serial.trim(), mount_path, class.tier());
        drive.device_path = Some(device.path.clone());
        drive.fs_type = Some(self.filesystem.to_lowercase());
        drive.total_bytes = device.size.unwrap_or(0);
        drive
    }
}

/// `/dev/sda` → `/dev/sda1`, `/dev/nvme0n1` → `/dev/nvme0n1p1`.
fn predicted_partition_path(device: &Path) -> PathBuf {
    let name = device.to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p1", name))
    } else {
        PathBuf::from(format!("{}1", name))
    }
}

/// lsblk reports booleans as `true`/`false`, `"1"`/`"0"` or `1`/`0`
/// depending on its version.
fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => Ok(n.as_u64().unwrap_or(0) != 0),
        serde_json::Value::String(s) => Ok(matches!(s.as_str(), "1" | "true")),
        _ => Ok(false),
    }
}

fn flexible_u64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => Ok(n.as_u64()),
        serde_json::Value::String(s) => Ok(s.parse().ok()),
        _ => Ok(None),
    }
}
