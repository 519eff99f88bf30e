//! Rendering of PXE boot configuration files.
//!
//! A boot configuration is rendered from a template chosen by (purpose,
//! arch, subarch), falling back to progressively less specific templates
//! and finally to the generic `config.template`. The generic fallback is
//! required to exist; a search path with no templates at all is a
//! deployment error.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use minijinja::{context, Environment};
use tracing::trace;

use crate::error::{PxeError, Result};
use crate::kernel_opts::{EphemeralImages, KernelParameters, ReleaseFamily};
use crate::paths::compose_image_path;

/// Renders PXE boot configuration files from an ordered template search
/// path.
#[derive(Debug, Clone)]
pub struct PxeConfigRenderer {
    template_dirs: Vec<PathBuf>,
    ephemeral: EphemeralImages,
}

/// Possible template filenames, most specific first:
///
///   config.{purpose}.{arch}.{subarch}.template
///   config.{purpose}.{arch}.template
///   config.{purpose}.template
///   config.template
pub fn template_filenames(purpose: &str, arch: &str, subarch: &str) -> Vec<String> {
    let mut elements = vec![purpose, arch, subarch];
    let mut filenames = Vec::with_capacity(4);
    while !elements.is_empty() {
        filenames.push(format!("config.{}.template", elements.join(".")));
        elements.pop();
    }
    filenames.push("config.template".to_string());
    filenames
}

impl PxeConfigRenderer {
    pub fn new(template_dirs: Vec<PathBuf>, ephemeral: EphemeralImages) -> Self {
        Self {
            template_dirs,
            ephemeral,
        }
    }

    /// Locate the most specific template available for the given key.
    ///
    /// Candidate filenames are probed in specificity order across the
    /// whole search path; the first file found wins.
    pub fn find_template(&self, purpose: &str, arch: &str, subarch: &str) -> Result<PathBuf> {
        for filename in template_filenames(purpose, arch, subarch) {
            for dir in &self.template_dirs {
                let candidate = dir.join(&filename);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
        Err(PxeError::NoTemplateFound {
            search_path: self.template_dirs.clone(),
        })
    }

    /// Render a PXE configuration file for `params`.
    ///
    /// `extra` is a safety valve: callers assemble request parameters in
    /// another component and may pass along more than we need; extra
    /// entries must not break rendering and do not affect the output.
    pub fn render(
        &self,
        params: &KernelParameters,
        extra: &BTreeMap<String, String>,
    ) -> Result<String> {
        if !extra.is_empty() {
            trace!(ignored = extra.len(), "extra render parameters ignored");
        }

        // Templates are read on every render so they can be changed on
        // the fly without restarting the server.
        let path = self.find_template(&params.purpose, &params.arch, &params.subarch)?;
        let source = fs::read_to_string(&path)?;

        let family = ReleaseFamily::of(&params.release);
        let files = family.boot_files();
        let image_dir = compose_image_path(
            &params.arch,
            &params.subarch,
            &params.release,
            &params.purpose,
        );

        let mut env = Environment::new();
        env.add_template("config", &source)?;
        let template = env.get_template("config")?;
        let rendered = template.render(context! {
            kernel_path => format!("{image_dir}/{}", files.kernel),
            initrd_path => format!("{image_dir}/{}", files.initrd),
            kernel_command => family.compose_command_line(params, &self.ephemeral)?,
            kernel_params => params,
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    const TEST_TEMPLATE: &str = "DEFAULT execute\n\nLABEL execute\n  \
        SAY Booting {{ kernel_params.hostname }}\n  \
        KERNEL {{ kernel_path }}\n  INITRD {{ initrd_path }}\n  \
        APPEND {{ kernel_command }}\n";

    fn install_params() -> KernelParameters {
        KernelParameters {
            arch: "amd64".to_string(),
            subarch: "generic".to_string(),
            release: "precise".to_string(),
            purpose: "install".to_string(),
            hostname: "node01".to_string(),
            domain: Some("example.com".to_string()),
            preseed_url: "http://localhost/preseed".to_string(),
            log_host: "10.0.0.1".to_string(),
            fs_host: "10.0.0.1".to_string(),
            extra_opts: None,
        }
    }

    fn renderer_with(templates: &[(&str, &str)]) -> (tempfile::TempDir, PxeConfigRenderer) {
        let dir = tempdir().unwrap();
        for (name, content) in templates {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let renderer = PxeConfigRenderer::new(
            vec![dir.path().to_path_buf()],
            EphemeralImages::new(dir.path().join("ephemeral-unused")),
        );
        (dir, renderer)
    }

    #[test]
    fn test_template_filenames_order() {
        assert_eq!(
            template_filenames("install", "i386", "generic"),
            vec![
                "config.install.i386.generic.template",
                "config.install.i386.template",
                "config.install.template",
                "config.template",
            ]
        );
    }

    #[test]
    fn test_find_template_full_fallback() {
        // Only the generic template exists; the search must traverse all
        // the way down to it.
        let (_dir, renderer) = renderer_with(&[("config.template", TEST_TEMPLATE)]);
        let found = renderer.find_template("install", "i386", "generic").unwrap();
        assert!(found.ends_with("config.template"));
    }

    #[test]
    fn test_find_template_prefers_most_specific() {
        let (_dir, renderer) = renderer_with(&[
            ("config.template", TEST_TEMPLATE),
            ("config.install.template", TEST_TEMPLATE),
            ("config.install.i386.generic.template", TEST_TEMPLATE),
        ]);
        let found = renderer.find_template("install", "i386", "generic").unwrap();
        assert!(found.ends_with("config.install.i386.generic.template"));

        // A different arch falls back past the specific one.
        let found = renderer.find_template("install", "amd64", "generic").unwrap();
        assert!(found.ends_with("config.install.template"));
    }

    #[test]
    fn test_no_template_at_all_is_fatal() {
        let (_dir, renderer) = renderer_with(&[]);
        let error = renderer
            .find_template("install", "i386", "generic")
            .unwrap_err();
        assert!(matches!(error, PxeError::NoTemplateFound { .. }));
    }

    #[test]
    fn test_render_injects_paths_and_command() {
        let (_dir, renderer) = renderer_with(&[("config.template", TEST_TEMPLATE)]);
        let rendered = renderer
            .render(&install_params(), &BTreeMap::new())
            .unwrap();

        assert!(rendered.starts_with("DEFAULT execute"));
        assert!(rendered.contains("KERNEL amd64/generic/precise/install/linux"));
        assert!(rendered.contains("INITRD amd64/generic/precise/install/initrd.gz"));
        assert!(rendered.contains("APPEND nomodeset"));
        assert!(rendered.contains("SAY Booting node01"));
    }

    #[test]
    fn test_render_centos_release_uses_centos_boot_files() {
        let (_dir, renderer) = renderer_with(&[("config.template", TEST_TEMPLATE)]);
        let mut params = install_params();
        params.release = "centos6".to_string();
        let rendered = renderer.render(&params, &BTreeMap::new()).unwrap();

        assert!(rendered.contains("KERNEL amd64/generic/centos6/install/vmlinuz"));
        assert!(rendered.contains("INITRD amd64/generic/centos6/install/initrd.img"));
        assert!(rendered.contains("APPEND vga=normal ip=dhcp ks=http://localhost/preseed"));
    }

    #[test]
    fn test_render_ignores_extra_parameters() {
        let (_dir, renderer) = renderer_with(&[("config.template", TEST_TEMPLATE)]);
        let params = install_params();

        let plain = renderer.render(&params, &BTreeMap::new()).unwrap();
        let mut extra = BTreeMap::new();
        extra.insert("local".to_string(), "10.0.0.1".to_string());
        extra.insert("remote".to_string(), "10.0.0.2".to_string());
        extra.insert("cluster_uuid".to_string(), "abc".to_string());
        let with_extra = renderer.render(&params, &extra).unwrap();

        assert_eq!(plain, with_extra);
    }

    #[test]
    fn test_render_shipped_templates() {
        // The templates shipped in this repository must render.
        let shipped = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../templates/pxe");
        let renderer = PxeConfigRenderer::new(
            vec![shipped],
            EphemeralImages::new("unused"),
        );

        let rendered = renderer
            .render(&install_params(), &BTreeMap::new())
            .unwrap();
        assert!(rendered.contains("KERNEL amd64/generic/precise/install/linux"));

        let mut local = install_params();
        local.purpose = "local".to_string();
        let rendered = renderer.render(&local, &BTreeMap::new()).unwrap();
        assert!(rendered.contains("LOCALBOOT 0"));
    }
}
