//! Mountpoint staging.
//!
//! Images sourced from subdirectories of the root tree must not see the
//! content of children mounted below them. The staging pass copies the root
//! tree to `<tmp>/root`, moves every declared mountpoint out to
//! `<tmp>/mp-<sanitized>` and leaves a correctly-permissioned empty
//! directory behind, so each image reads exactly the tree it would see at
//! runtime.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use color_eyre::{
	eyre::{bail, eyre, WrapErr},
	Result,
};
use indexmap::IndexMap;
use nix::libc;
use tracing::{debug, info};

use crate::exec;
use crate::image::Build;
use crate::util::sanitize_path;

/// Cleanup token for the temporary directory. If the directory was created
/// by us (or observed empty at startup), its contents are removed when the
/// token drops.
pub struct TmpGuard {
	path: PathBuf,
	generated: bool,
}

impl Drop for TmpGuard {
	fn drop(&mut self) {
		if !self.generated {
			return;
		}
		let Ok(entries) = std::fs::read_dir(&self.path) else { return };
		for entry in entries.flatten() {
			let p = entry.path();
			let _ = if p.is_dir() && !p.is_symlink() {
				std::fs::remove_dir_all(&p)
			} else {
				std::fs::remove_file(&p)
			};
		}
	}
}

/// Pre-flight: the temporary directory must be empty (or absent, in which
/// case it is created). Only a tmp we found empty is cleaned up at exit.
pub fn check_tmp(tmp: &Path) -> Result<TmpGuard> {
	let generated = match std::fs::read_dir(tmp) {
		Ok(mut entries) => {
			if entries.next().is_some() {
				bail!("tmppath '{}' exists and is not empty", tmp.display());
			}
			true
		},
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			std::fs::create_dir_all(tmp)
				.wrap_err_with(|| format!("mkdir {}", tmp.display()))?;
			true
		},
		Err(e) => return Err(e).wrap_err_with(|| format!("opendir {}", tmp.display())),
	};
	Ok(TmpGuard { path: tmp.to_path_buf(), generated })
}

fn copy_times(reference: &std::fs::Metadata, to: &Path) -> Result<()> {
	let times = [
		libc::timespec { tv_sec: reference.atime(), tv_nsec: reference.atime_nsec() },
		libc::timespec { tv_sec: reference.mtime(), tv_nsec: reference.mtime_nsec() },
	];
	let cpath = CString::new(to.as_os_str().as_bytes())?;
	// SAFETY: path and times outlive the call; utimensat reads them only.
	let ret = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
	if ret != 0 {
		bail!("utimensat {}: {}", to.display(), std::io::Error::last_os_error());
	}
	Ok(())
}

/// Build the staging tree and resolve every image's effective source
/// directory.
pub fn stage(build: &mut Build) -> Result<()> {
	let needs_root = build
		.images
		.values()
		.any(|i| !i.empty && !i.no_rootpath() && i.srcpath.is_none());
	if !needs_root {
		build.ctx.opts.disable_rootpath();
	}

	let tmp = build.ctx.opts.tmppath().to_path_buf();
	let root_staging = tmp.join("root");

	// mountpoint -> staging directory, one entry per distinct path
	let mut mountpaths: IndexMap<String, PathBuf> = IndexMap::new();
	for image in build.images.values() {
		if let Some(mp) = &image.mountpoint {
			if !mp.is_empty() {
				mountpaths
					.entry(mp.clone())
					.or_insert_with(|| tmp.join(format!("mp-{}", sanitize_path(mp))));
			}
		}
	}

	if needs_root {
		let rootpath = build
			.ctx
			.opts
			.rootpath()
			.ok_or_else(|| eyre!("rootpath disabled but a root tree is required"))?
			.to_path_buf();
		info!("copying rootfs from {} to staging tree", rootpath.display());
		exec::copy_tree(&rootpath, &root_staging)?;

		for (mp, staged) in &mountpaths {
			let carved = root_staging.join(mp);
			debug!("staging mountpoint '{mp}' at {}", staged.display());
			let meta = std::fs::metadata(&carved)
				.wrap_err_with(|| format!("mountpoint '{mp}' does not exist in the root tree"))?;
			exec::move_tree(&carved, staged)?;
			std::fs::create_dir(&carved)?;
			std::fs::set_permissions(&carved, meta.permissions())?;
			nix::unistd::chown(
				&carved,
				Some(nix::unistd::Uid::from_raw(meta.uid())),
				Some(nix::unistd::Gid::from_raw(meta.gid())),
			)
			.wrap_err_with(|| format!("chown {}", carved.display()))?;
		}

		// moving the mountpoints dirtied their ancestors' mtimes; restore
		// them from the original tree, deepest first
		let mut dirs: Vec<PathBuf> = Vec::new();
		for mp in mountpaths.keys() {
			let mut rel = PathBuf::from(mp);
			loop {
				if !dirs.contains(&rel) {
					dirs.push(rel.clone());
				}
				if !rel.pop() || rel.as_os_str().is_empty() {
					break;
				}
			}
		}
		dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
		for rel in dirs {
			let reference = std::fs::metadata(rootpath.join(&rel))?;
			copy_times(&reference, &root_staging.join(&rel))?;
		}
		copy_times(&std::fs::metadata(&rootpath)?, &root_staging)?;
	}

	for image in build.images.values_mut() {
		image.srcdir = if let Some(src) = &image.srcpath {
			Some(src.clone())
		} else if let Some(mp) = image.mountpoint.as_ref().filter(|m| !m.is_empty()) {
			mountpaths.get(mp).cloned()
		} else if image.empty || image.no_rootpath() {
			None
		} else {
			needs_root.then(|| root_staging.clone())
		};
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::image::Build;
	use crate::opts::Opts;
	use std::ffi::OsString;

	fn build_in(dir: &Path, cfg_text: &str) -> Build {
		let cfg: Config = hcl::from_str(cfg_text).unwrap();
		let argv: Vec<OsString> = vec![
			OsString::from("genimage"),
			OsString::from("--rootpath"),
			dir.join("root").into_os_string(),
			OsString::from("--tmppath"),
			dir.join("tmp").into_os_string(),
			OsString::from("--outputpath"),
			dir.join("images").into_os_string(),
		];
		let opts = Opts::load(&argv, None).unwrap();
		Build::from_config(opts, &cfg).unwrap()
	}

	#[test]
	fn tmp_preflight_rejects_nonempty() {
		let dir = tempfile::tempdir().unwrap();
		let tmp = dir.path().join("tmp");
		std::fs::create_dir(&tmp).unwrap();
		std::fs::write(tmp.join("junk"), b"x").unwrap();
		assert!(check_tmp(&tmp).is_err());
	}

	#[test]
	fn tmp_guard_cleans_generated_dir() {
		let dir = tempfile::tempdir().unwrap();
		let tmp = dir.path().join("tmp");
		{
			let _guard = check_tmp(&tmp).unwrap();
			std::fs::write(tmp.join("scratch"), b"x").unwrap();
		}
		assert!(tmp.exists());
		assert_eq!(std::fs::read_dir(&tmp).unwrap().count(), 0);
	}

	#[test]
	fn mountpoints_are_carved_out() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().join("root");
		std::fs::create_dir_all(root.join("boot/efi")).unwrap();
		std::fs::create_dir_all(root.join("home/user")).unwrap();
		std::fs::write(root.join("boot/efi/grub.cfg"), b"cfg").unwrap();
		std::fs::write(root.join("etc-file"), b"etc").unwrap();
		std::fs::create_dir(dir.path().join("tmp")).unwrap();

		let mut build = build_in(
			dir.path(),
			r#"
			image "root.ext4" {
				size = "64M"
				ext4 {}
			}
			image "efi.vfat" {
				size = "16M"
				mountpoint = "/boot/efi"
				vfat {}
			}
			"#,
		);
		stage(&mut build).unwrap();

		let tmp = dir.path().join("tmp");
		// carved-out mountpoint is empty in the staging root
		assert!(tmp.join("root/boot/efi").is_dir());
		assert_eq!(std::fs::read_dir(tmp.join("root/boot/efi")).unwrap().count(), 0);
		// its content moved to the mp- directory
		assert!(tmp.join("mp-boot-efi/grub.cfg").is_file());
		// untouched content stays
		assert!(tmp.join("root/etc-file").is_file());

		assert_eq!(build.images["root.ext4"].srcdir.as_deref(), Some(tmp.join("root").as_path()));
		assert_eq!(
			build.images["efi.vfat"].srcdir.as_deref(),
			Some(tmp.join("mp-boot-efi").as_path())
		);
	}

	#[test]
	fn srcpath_and_empty_resolution() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("override")).unwrap();
		std::fs::create_dir(dir.path().join("tmp")).unwrap();
		let srcdir = dir.path().join("override");
		let mut build = build_in(
			dir.path(),
			&format!(
				r#"
				image "a.ext4" {{
					size = "1M"
					srcpath = "{src}"
					ext4 {{}}
				}}
				image "b.ext4" {{
					size = "1M"
					empty = true
					ext4 {{}}
				}}
				"#,
				src = srcdir.display()
			),
		);
		stage(&mut build).unwrap();
		assert_eq!(build.images["a.ext4"].srcdir.as_deref(), Some(srcdir.as_path()));
		assert_eq!(build.images["b.ext4"].srcdir, None);
		// nothing needed the root tree, so none was staged
		assert!(!dir.path().join("tmp/root").exists());
	}
}
