//! Shader subsystem
//!
//! Compiles and links the active program, resolves its uniforms against the registry once per
//! link, uploads video frames into a texture, and draws a full-frame rectangle. All GPU work
//! goes through [`GpuBackend`].

mod glow_backend;
mod gpu;
mod headless;
mod program;
mod rectangle;
mod texture;
mod uniform;

pub use glow_backend::GlowBackend;
pub use gpu::{
    ActiveUniform, GeometryId, GpuBackend, ProgramId, ShaderId, TextureId, UniformKind,
    UniformLocation, UniformValue, ATTRIB_POSITION, ATTRIB_TEXCOORD,
};
pub use headless::{HeadlessBackend, HeadlessProbe};
pub use program::ShaderProgram;
pub use rectangle::ShaderRectangle;
pub use texture::ShaderTexture;
pub use uniform::{
    smoothing_alpha, Builtin, FrameContext, ShaderUniform, ShaderUniforms, UniformBindings,
    UniformSource,
};

use std::path::{Path, PathBuf};

use crate::assets::read_to_string_result;
use crate::error::{Result, ShaderStage, SourceLocation};

/// Where one stage's text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOrigin {
    File(PathBuf),
    Inline,
}

#[derive(Debug, Clone)]
struct StageText {
    origin: StageOrigin,
    text: String,
}

impl StageText {
    fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            origin: StageOrigin::File(path.to_path_buf()),
            text: read_to_string_result(path)?,
        })
    }

    /// Re-read a file-backed stage. True when the text changed.
    fn reload(&mut self) -> Result<bool> {
        let StageOrigin::File(path) = &self.origin else {
            return Ok(false);
        };
        let text = read_to_string_result(path)?;
        let changed = text != self.text;
        self.text = text;
        Ok(changed)
    }
}

/// Vertex + fragment source text, with explicit reload for file-backed stages.
#[derive(Debug, Clone)]
pub struct ShaderSource {
    vertex: StageText,
    fragment: StageText,
    /// Bumped whenever the text changes.
    generation: u64,
}

impl ShaderSource {
    pub fn from_files(vertex: &Path, fragment: &Path) -> Result<Self> {
        Ok(Self {
            vertex: StageText::load(vertex)?,
            fragment: StageText::load(fragment)?,
            generation: 0,
        })
    }

    pub fn inline(vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            vertex: StageText {
                origin: StageOrigin::Inline,
                text: vertex.into(),
            },
            fragment: StageText {
                origin: StageOrigin::Inline,
                text: fragment.into(),
            },
            generation: 0,
        }
    }

    /// Built-in pass-through vertex stage with a file-backed fragment stage.
    pub fn with_default_vertex(fragment: &Path) -> Result<Self> {
        Ok(Self {
            vertex: StageText {
                origin: StageOrigin::Inline,
                text: DEFAULT_VERTEX.to_string(),
            },
            fragment: StageText::load(fragment)?,
            generation: 0,
        })
    }

    pub fn text(&self, stage: ShaderStage) -> &str {
        match stage {
            ShaderStage::Vertex => &self.vertex.text,
            ShaderStage::Fragment => &self.fragment.text,
        }
    }

    pub fn origin(&self, stage: ShaderStage) -> &StageOrigin {
        match stage {
            ShaderStage::Vertex => &self.vertex.origin,
            ShaderStage::Fragment => &self.fragment.origin,
        }
    }

    /// Paths of file-backed stages (what a watcher should observe).
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        [&self.vertex.origin, &self.fragment.origin]
            .into_iter()
            .filter_map(|o| match o {
                StageOrigin::File(p) => Some(p.clone()),
                StageOrigin::Inline => None,
            })
            .collect()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Re-read file-backed stages. Returns whether any text changed; on error the previous
    /// text is kept.
    pub fn reload(&mut self) -> Result<bool> {
        let mut next = self.clone();
        let changed = next.vertex.reload()? | next.fragment.reload()?;
        if changed {
            next.generation += 1;
        }
        *self = next;
        Ok(changed)
    }

    /// Replace inline text (used by front ends that edit shaders in memory).
    pub fn set_inline(&mut self, stage: ShaderStage, text: impl Into<String>) {
        let slot = match stage {
            ShaderStage::Vertex => &mut self.vertex,
            ShaderStage::Fragment => &mut self.fragment,
        };
        *slot = StageText {
            origin: StageOrigin::Inline,
            text: text.into(),
        };
        self.generation += 1;
    }
}

/// Pass-through vertex stage matching the rectangle's attribute layout.
pub const DEFAULT_VERTEX: &str = "#version 330 core
in vec2 a_position;
in vec2 a_texcoord;
out vec2 v_uv;
void main() {
    v_uv = a_texcoord;
    gl_Position = vec4(a_position, 0.0, 1.0);
}
";

/// Pull a line (and column, when given) out of a driver info log.
///
/// Recognised shapes:
/// - `0:12(5): error: ...`   (Mesa)
/// - `ERROR: 0:12: ...`      (ANGLE, Apple, many desktop drivers)
/// - `0(12) : error C0000: ...` (NVIDIA)
pub fn parse_source_location(log: &str) -> Option<SourceLocation> {
    log.lines().find_map(parse_line)
}

fn leading_number(s: &str) -> Option<(u32, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((s[..end].parse().ok()?, &s[end..]))
}

fn parse_line(line: &str) -> Option<SourceLocation> {
    let line = line.trim();
    let line = line
        .strip_prefix("ERROR:")
        .or_else(|| line.strip_prefix("WARNING:"))
        .map(str::trim_start)
        .unwrap_or(line);

    // source string index
    let (_, rest) = leading_number(line)?;

    if let Some(rest) = rest.strip_prefix(':') {
        let (line_no, rest) = leading_number(rest)?;
        let column = rest
            .strip_prefix('(')
            .and_then(leading_number)
            .filter(|(_, r)| r.starts_with(')'))
            .map(|(c, _)| c);
        return Some(SourceLocation {
            line: line_no,
            column,
        });
    }

    if let Some(rest) = rest.strip_prefix('(') {
        let (line_no, rest) = leading_number(rest)?;
        if rest.starts_with(')') {
            return Some(SourceLocation {
                line: line_no,
                column: None,
            });
        }
    }
    None
}
