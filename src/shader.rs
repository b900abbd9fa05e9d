//! Shader bytecode loading.
//!
//! The renderer never compiles shaders. Stages arrive as opaque blobs from a
//! [`ShaderLoader`]; the Vulkan backend expects SPIR-V built from the GLSL in
//! `shaders/`, the software backend resolves compute stages by name.

use std::path::PathBuf;

use crate::error::{RenderError, RenderResult};

/// Name of the culling compute stage.
pub const CULL_SHADER: &str = "sprite_cull.comp";
/// Name of the vertex generation compute stage.
pub const GENERATE_SHADER: &str = "sprite_generate.comp";
/// Name of the sprite vertex stage.
pub const VERTEX_SHADER: &str = "sprite.vert";
/// Name of the sprite pixel stage.
pub const PIXEL_SHADER: &str = "sprite.frag";

/// One compiled shader stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBlob {
    pub name: String,
    pub entry_point: String,
    pub bytes: Vec<u8>,
}

impl ShaderBlob {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            entry_point: "main".to_string(),
            bytes,
        }
    }

    /// SPIR-V words of the blob.
    pub fn spirv_words(&self) -> RenderResult<Vec<u32>> {
        if self.bytes.len() % 4 != 0 || self.bytes.is_empty() {
            return Err(RenderError::ShaderLoad {
                name: self.name.clone(),
                reason: format!("{} bytes is not a whole number of words", self.bytes.len()),
            });
        }
        Ok(bytemuck::pod_collect_to_vec(&self.bytes))
    }
}

/// Source of precompiled shader blobs.
pub trait ShaderLoader {
    fn load(&self, name: &str) -> RenderResult<Vec<u8>>;
}

/// Loads `<root>/<name>.spv` from disk.
#[derive(Debug, Clone)]
pub struct FileShaderLoader {
    root: PathBuf,
}

impl FileShaderLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ShaderLoader for FileShaderLoader {
    fn load(&self, name: &str) -> RenderResult<Vec<u8>> {
        let path = self.root.join(format!("{name}.spv"));
        log::debug!("Loading shader {}", path.display());
        std::fs::read(&path).map_err(|e| RenderError::ShaderLoad {
            name: name.to_string(),
            reason: format!("{}: {e}", path.display()),
        })
    }
}

/// The four stages of the sprite pipeline.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub cull: ShaderBlob,
    pub generate: ShaderBlob,
    pub vertex: ShaderBlob,
    pub pixel: ShaderBlob,
}

impl ShaderSet {
    pub fn load(loader: &dyn ShaderLoader) -> RenderResult<Self> {
        let load = |name: &str| -> RenderResult<ShaderBlob> {
            Ok(ShaderBlob::new(name, loader.load(name)?))
        };
        Ok(Self {
            cull: load(CULL_SHADER)?,
            generate: load(GENERATE_SHADER)?,
            vertex: load(VERTEX_SHADER)?,
            pixel: load(PIXEL_SHADER)?,
        })
    }

    /// Name-only blobs, enough for the software backend's built-in kernels.
    pub fn builtin() -> Self {
        Self {
            cull: ShaderBlob::new(CULL_SHADER, Vec::new()),
            generate: ShaderBlob::new(GENERATE_SHADER, Vec::new()),
            vertex: ShaderBlob::new(VERTEX_SHADER, Vec::new()),
            pixel: ShaderBlob::new(PIXEL_SHADER, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapLoader;

    impl ShaderLoader for MapLoader {
        fn load(&self, name: &str) -> RenderResult<Vec<u8>> {
            match name {
                PIXEL_SHADER => Err(RenderError::ShaderLoad {
                    name: name.to_string(),
                    reason: "missing".into(),
                }),
                _ => Ok(vec![0x03, 0x02, 0x23, 0x07]),
            }
        }
    }

    #[test]
    fn test_missing_stage_fails_whole_set() {
        let err = ShaderSet::load(&MapLoader).unwrap_err();
        assert!(matches!(err, RenderError::ShaderLoad { ref name, .. } if name == PIXEL_SHADER));
    }

    #[test]
    fn test_spirv_words() {
        let blob = ShaderBlob::new("x", vec![0x03, 0x02, 0x23, 0x07]);
        assert_eq!(blob.spirv_words().unwrap(), vec![0x0723_0203]);
        assert!(ShaderBlob::new("y", vec![1, 2, 3]).spirv_words().is_err());
    }

    #[test]
    fn test_file_loader_reports_path() {
        let loader = FileShaderLoader::new("/nonexistent/shaders");
        let err = loader.load(CULL_SHADER).unwrap_err();
        assert!(err.to_string().contains("sprite_cull.comp.spv"));
    }
}
