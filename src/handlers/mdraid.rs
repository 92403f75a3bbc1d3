//! mdraid (v1.2 superblock) member images.
//!
//! Produces a raid1 member that mdadm can assemble without ever having run
//! the kernel md driver: 256-byte superblock at sector 8, write-intent
//! bitmap superblock at sector 16, bad-block log after the bitmap, data at
//! sector 2048. Members of the same array share the array metadata through
//! the build context; a `parent` reference clones the parent's superblock
//! and takes the next device role.

use std::collections::HashMap;

use color_eyre::{
	eyre::{bail, eyre},
	Result,
};
use serde::{Deserialize, Serialize};

use crate::handlers::{find_child, Handler};
use crate::image::{Child, Context, Image, Partition};
use crate::io;
use crate::util::roundup;

const MD_SB_MAGIC: u32 = 0xA92B_4EFC;
const MD_FEATURE_BITMAP_OFFSET: u32 = 1;
const MD_ROLE_MAX: u16 = 0xFEFF;

const DATA_OFFSET_SECTORS: u64 = 2048;
const DATA_OFFSET_BYTES: u64 = DATA_OFFSET_SECTORS * 512;
const SUPER_OFFSET_SECTORS: u64 = 8;
const BITMAP_OFFSET_SECTORS: u32 = 8;
const BITMAP_SECTORS_MAX: u64 = 256;
/// 4 KiB; keeps the member size compatible with 4k-sector devices.
const ALIGN_BYTES: u64 = 8 * 512;

const BITMAP_MAGIC: u32 = 0x6D74_6962; // "bitm"

/// Array metadata shared between member images of one array.
#[derive(Default)]
pub struct Shared {
	/// Creation time, identical across all members.
	pub ctime: Option<u64>,
	pub arrays: HashMap<String, ArrayEntry>,
}

pub struct ArrayEntry {
	pub superblock: Vec<u8>,
	pub last_role: u16,
}

const fn default_level() -> i64 {
	1
}

const fn default_devices() -> i64 {
	1
}

const fn default_role() -> i64 {
	-1
}

const fn default_timestamp() -> i64 {
	-1
}

fn default_label() -> String {
	"localhost:42".to_owned()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct MdraidOpts {
	#[serde(default = "default_label")]
	pub label: String,
	#[serde(default = "default_level")]
	pub level: i64,
	#[serde(default = "default_devices")]
	pub devices: i64,
	/// Device role in the array; -1 assigns automatically.
	#[serde(default = "default_role")]
	pub role: i64,
	/// Array creation time; -1 uses the (shared) current time.
	#[serde(default = "default_timestamp")]
	pub timestamp: i64,
	pub raid_uuid: Option<String>,
	pub disk_uuid: Option<String>,
	/// Data image placed inside the array.
	pub image: Option<String>,
	/// Member image to inherit the array metadata from.
	pub parent: Option<String>,
}

impl Default for MdraidOpts {
	fn default() -> Self {
		Self {
			label: default_label(),
			level: 1,
			devices: 1,
			role: -1,
			timestamp: -1,
			raid_uuid: None,
			disk_uuid: None,
			image: None,
			parent: None,
		}
	}
}

pub struct Mdraid {
	opts: MdraidOpts,
}

impl Mdraid {
	#[must_use]
	pub fn new(opts: MdraidOpts) -> Self {
		Self { opts }
	}
}

fn uuid_bytes(value: Option<&str>) -> Result<[u8; 16]> {
	match value {
		Some(v) => Ok(*uuid::Uuid::parse_str(v)
			.map_err(|e| eyre!("invalid UUID '{v}': {e}"))?
			.as_bytes()),
		None => Ok(*uuid::Uuid::new_v4().as_bytes()),
	}
}

/// Additive checksum over the superblock (including the device-role array),
/// with the checksum field itself zeroed.
fn sb_csum(sb: &[u8]) -> u32 {
	let mut sum: u64 = 0;
	let mut i = 0;
	while i + 4 <= sb.len() {
		if i != 216 {
			sum += u64::from(u32::from_le_bytes(sb[i..i + 4].try_into().expect("4 bytes")));
		}
		i += 4;
	}
	if sb.len() - i == 2 {
		sum += u64::from(u16::from_le_bytes(sb[i..i + 2].try_into().expect("2 bytes")));
	}
	((sum & 0xFFFF_FFFF) + (sum >> 32)) as u32
}

struct BitmapLayout {
	chunksize: u32,
	sectors_reserved: u32,
}

/// Grow the bitmap chunk size until the reserved sectors fit the fixed
/// bitmap window.
fn bitmap_layout(sync_size: u64) -> BitmapLayout {
	let mut chunksize: u64 = 64 * 1024 * 1024;
	let mut sectors_reserved = roundup(sync_size / chunksize, 8);
	while sectors_reserved > BITMAP_SECTORS_MAX {
		chunksize *= 2;
		sectors_reserved = roundup(sync_size / chunksize, 8);
	}
	BitmapLayout { chunksize: chunksize as u32, sectors_reserved: sectors_reserved as u32 }
}

fn bitmap_superblock(array_uuid: &[u8], sync_size: u64) -> [u8; 256] {
	let layout = bitmap_layout(sync_size);
	let mut b = [0u8; 256];
	b[0..4].copy_from_slice(&BITMAP_MAGIC.to_le_bytes());
	// v4 is compatible with mdraid v1.2
	b[4..8].copy_from_slice(&4u32.to_le_bytes());
	b[8..24].copy_from_slice(array_uuid);
	// events (24) and events_cleared (32) start at zero
	b[40..48].copy_from_slice(&sync_size.to_le_bytes());
	// state (48) clean
	b[52..56].copy_from_slice(&layout.chunksize.to_le_bytes());
	b[56..60].copy_from_slice(&5u32.to_le_bytes()); // daemon_sleep
	// write_behind (60) zero
	b[64..68].copy_from_slice(&layout.sectors_reserved.to_le_bytes());
	b
}

impl Handler for Mdraid {
	fn ty(&self) -> &'static str {
		"mdraid"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		if self.opts.level != 1 {
			bail!("{}: only raid level 1 (mirror) is supported", image.tag());
		}
		let mut depend = |name: &String| {
			image.partitions.push(Partition {
				name: String::new(),
				image: Some(name.clone()),
				in_partition_table: false,
				..Partition::default()
			});
		};
		if let Some(parent) = &self.opts.parent {
			depend(parent);
		}
		if let Some(data) = &self.opts.image {
			depend(data);
		}
		Ok(())
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		if let Some(parent) = &self.opts.parent {
			let parent = find_child(children, parent)
				.ok_or_else(|| eyre!("{}: could not find parent '{parent}'", image.tag()))?;
			if image.size == 0 {
				image.size = parent.size;
			}
		}
		if let Some(data) = &self.opts.image {
			let data = find_child(children, data)
				.ok_or_else(|| eyre!("{}: could not find '{data}'", image.tag()))?;
			if image.size == 0 {
				image.size = roundup(data.size + DATA_OFFSET_BYTES, ALIGN_BYTES);
			}
			if image.size < data.size + DATA_OFFSET_BYTES {
				bail!("{}: image too small to fit '{}'", image.tag(), data.file);
			}
		} else if self.opts.parent.is_none() {
			tracing::info!("{}: array is created without data", image.tag());
		}
		if image.size != roundup(image.size, ALIGN_BYTES) {
			bail!("{}: image size has to be aligned to {ALIGN_BYTES} bytes", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let mut shared = ctx.mdraid.borrow_mut();
		let ctime = *shared.ctime.get_or_insert_with(|| {
			std::time::SystemTime::now()
				.duration_since(std::time::UNIX_EPOCH)
				.map(|d| d.as_secs())
				.unwrap_or(0)
		});

		// role and inherited metadata come from the parent member, if any
		let (inherited, role) = match &self.opts.parent {
			Some(parent) => {
				let entry = shared
					.arrays
					.get_mut(parent)
					.ok_or_else(|| eyre!("{}: parent '{parent}' is not an mdraid image", image.tag()))?;
				let sb = entry.superblock.clone();
				let role = if self.opts.role >= 0 {
					self.opts.role as u16
				} else {
					entry.last_role += 1;
					entry.last_role
				};
				(Some(sb), role)
			},
			None => (None, if self.opts.role >= 0 { self.opts.role as u16 } else { 0 }),
		};

		let max_devices = match &inherited {
			Some(sb) => u32::from_le_bytes(sb[92..96].try_into().expect("4 bytes")) as u16,
			None => self.opts.devices as u16,
		};
		if role > MD_ROLE_MAX {
			bail!("{}: role has to be between 0 and {MD_ROLE_MAX}", image.tag());
		}
		if role >= max_devices {
			bail!(
				"{}: role of this image ({role}) has to be lower than the device count ({max_devices})",
				image.tag()
			);
		}

		let sb_len = 256 + usize::from(max_devices) * 2;
		let mut sb = vec![0u8; sb_len];

		if let Some(parent_sb) = inherited {
			sb.copy_from_slice(&parent_sb);
		} else {
			// array-constant section
			sb[0..4].copy_from_slice(&MD_SB_MAGIC.to_le_bytes());
			sb[4..8].copy_from_slice(&1u32.to_le_bytes()); // major_version
			sb[8..12].copy_from_slice(&MD_FEATURE_BITMAP_OFFSET.to_le_bytes());
			sb[16..32].copy_from_slice(&uuid_bytes(self.opts.raid_uuid.as_deref())?);
			let mut name = self.opts.label.clone().into_bytes();
			name.truncate(31);
			sb[32..32 + name.len()].copy_from_slice(&name);
			let ctime = if self.opts.timestamp >= 0 { self.opts.timestamp as u64 } else { ctime };
			sb[64..72].copy_from_slice(&(ctime & 0xFF_FFFF_FFFF).to_le_bytes());
			sb[72..76].copy_from_slice(&1u32.to_le_bytes()); // level
			let size_sectors = (image.size - DATA_OFFSET_BYTES) / 512;
			sb[80..88].copy_from_slice(&size_sectors.to_le_bytes());
			// chunksize (88) unused for raid1
			sb[92..96].copy_from_slice(&u32::from(max_devices).to_le_bytes());
		}

		// this-device section
		sb[96..100].copy_from_slice(&BITMAP_OFFSET_SECTORS.to_le_bytes());
		let data_size = u64::from_le_bytes(sb[80..88].try_into().expect("8 bytes"));
		sb[128..136].copy_from_slice(&DATA_OFFSET_SECTORS.to_le_bytes());
		sb[136..144].copy_from_slice(&data_size.to_le_bytes());
		sb[144..152].copy_from_slice(&SUPER_OFFSET_SECTORS.to_le_bytes());
		sb[160..164].copy_from_slice(&u32::from(role).to_le_bytes());
		sb[168..184].copy_from_slice(&uuid_bytes(self.opts.disk_uuid.as_deref())?);
		sb[185] = 9; // bblog shift: 512 sectors per bad block
		sb[186..188].copy_from_slice(&8u16.to_le_bytes()); // bblog size
		let bblog_offset = u32::from(BITMAP_OFFSET_SECTORS) + BITMAP_SECTORS_MAX as u32 + 8;
		sb[188..192].copy_from_slice(&bblog_offset.to_le_bytes());

		// array-state section
		let ctime_stored = u64::from_le_bytes(sb[64..72].try_into().expect("8 bytes"));
		sb[192..200].copy_from_slice(&ctime_stored.to_le_bytes()); // utime
		sb[220..224].copy_from_slice(&u32::from(max_devices).to_le_bytes());

		// all devices take the role matching their device number
		for i in 0..usize::from(max_devices) {
			sb[256 + i * 2..258 + i * 2].copy_from_slice(&(i as u16).to_le_bytes());
		}

		let csum = sb_csum(&sb);
		sb[216..220].copy_from_slice(&csum.to_le_bytes());

		io::prepare_image(&image.outfile, image.size)?;
		io::insert_data(&image.outfile, &sb, SUPER_OFFSET_SECTORS * 512)?;
		let bitmap = bitmap_superblock(&sb[16..32], data_size);
		io::insert_data(
			&image.outfile,
			&bitmap,
			(SUPER_OFFSET_SECTORS + u64::from(BITMAP_OFFSET_SECTORS)) * 512,
		)?;

		if let Some(data) = &self.opts.image {
			let data = find_child(children, data)
				.ok_or_else(|| eyre!("{}: could not find '{data}'", image.tag()))?;
			io::insert_image(&image.outfile, Some(&data.outfile), data.size, DATA_OFFSET_BYTES, 0)?;
		}

		shared.arrays.insert(
			image.file.clone(),
			ArrayEntry { superblock: sb, last_role: role.max(0) },
		);
		Ok(())
	}
}
