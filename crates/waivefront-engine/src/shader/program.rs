use super::gpu::{GpuBackend, ProgramId};
use super::uniform::{FrameContext, ShaderUniforms, UniformBindings};
use super::ShaderSource;
use crate::error::{Result, ShaderStage};
use crate::registry::RegistrySnapshot;

/// A linked program plus its resolved uniforms.
#[derive(Debug)]
pub struct ShaderProgram {
    id: ProgramId,
    uniforms: ShaderUniforms,
    generation: u64,
}

impl ShaderProgram {
    /// Compile both stages, link, and resolve uniforms against `snap`.
    ///
    /// Stage objects are deleted whether or not linking succeeds.
    pub fn link<B: GpuBackend + ?Sized>(
        gpu: &mut B,
        source: &ShaderSource,
        bindings: &UniformBindings,
        snap: &RegistrySnapshot,
    ) -> Result<Self> {
        let vs = gpu.compile_shader(ShaderStage::Vertex, source.text(ShaderStage::Vertex))?;
        let fs = match gpu.compile_shader(ShaderStage::Fragment, source.text(ShaderStage::Fragment)) {
            Ok(fs) => fs,
            Err(e) => {
                gpu.delete_shader(vs);
                return Err(e);
            }
        };
        let linked = gpu.link_program(vs, fs);
        gpu.delete_shader(vs);
        gpu.delete_shader(fs);
        let id = linked?;

        let active = gpu.active_uniforms(id);
        let uniforms = ShaderUniforms::resolve(active, bindings, snap);
        crate::logi!(
            "SHADER",
            "program {} linked ({} uniforms, generation {})",
            id.0,
            uniforms.len(),
            source.generation()
        );
        Ok(Self {
            id,
            uniforms,
            generation: source.generation(),
        })
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn uniforms(&self) -> &ShaderUniforms {
        &self.uniforms
    }

    /// Source generation this program was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Make the program current and push changed uniforms. Returns the push count.
    pub fn apply<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        snap: &RegistrySnapshot,
        ctx: &FrameContext,
    ) -> usize {
        gpu.use_program(self.id);
        self.uniforms.update(gpu, snap, ctx)
    }

    pub fn release<B: GpuBackend + ?Sized>(self, gpu: &mut B) {
        gpu.delete_program(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::shader::{HeadlessBackend, UniformValue, DEFAULT_VERTEX};

    #[test]
    fn link_resolves_builtins_and_frees_stages() {
        let mut gpu = HeadlessBackend::new();
        let probe = gpu.probe();
        let src = ShaderSource::inline(
            DEFAULT_VERTEX,
            "uniform float u_time;\nuniform sampler2D u_texture;\nvoid main() {}\n",
        );
        let snap = RegistrySnapshot::default();
        let mut prog = ShaderProgram::link(&mut gpu, &src, &UniformBindings::default(), &snap).unwrap();
        assert_eq!(probe.live_objects().0, 0);
        assert_eq!(prog.uniforms().len(), 2);

        let ctx = FrameContext {
            time: 1.5,
            ..FrameContext::default()
        };
        assert_eq!(prog.apply(&mut gpu, &snap, &ctx), 2);
        assert_eq!(probe.uniform("u_time"), Some(UniformValue::Float(1.5)));
        assert_eq!(probe.uniform("u_texture"), Some(UniformValue::Texture(0)));

        prog.release(&mut gpu);
        assert_eq!(probe.live_objects().1, 0);
    }

    #[test]
    fn compile_error_reports_stage_and_line() {
        let mut gpu = HeadlessBackend::new();
        let probe = gpu.probe();
        let src = ShaderSource::inline(DEFAULT_VERTEX, "void main() {\n#error nope\n}\n");
        let err = ShaderProgram::link(&mut gpu, &src, &UniformBindings::default(), &RegistrySnapshot::default())
            .unwrap_err();
        match err {
            EngineError::Compile { stage, location, .. } => {
                assert_eq!(stage, ShaderStage::Fragment);
                assert_eq!(location.map(|l| l.line), Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(probe.live_objects().0, 0);
    }
}
