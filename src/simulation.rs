//! What both engines have in common: they can be stepped, and they expose their current state by name.

use crate::{
    context::{Attachment, ComputeContext},
    error::EngineError,
    mrt::RenderCycle,
    pingpong::VariableEngine,
};

pub trait Simulation<C: ComputeContext> {
    /// Advance by one step.
    fn advance(&mut self, ctx: &mut C) -> Result<(), EngineError>;

    /// The state written by the last step, by variable or channel name.
    fn outputs(&self) -> Vec<(&str, Attachment<'_, C::Target>)>;
}

impl<C: ComputeContext> Simulation<C> for VariableEngine<C> {
    fn advance(&mut self, ctx: &mut C) -> Result<(), EngineError> {
        self.tick(ctx)
    }

    fn outputs(&self) -> Vec<(&str, Attachment<'_, C::Target>)> {
        VariableEngine::outputs(self)
            .into_iter()
            .map(|(name, target)| (name, Attachment { target, index: 0 }))
            .collect()
    }
}

impl<C: ComputeContext> Simulation<C> for RenderCycle<C> {
    fn advance(&mut self, ctx: &mut C) -> Result<(), EngineError> {
        self.render(ctx)
    }

    fn outputs(&self) -> Vec<(&str, Attachment<'_, C::Target>)> {
        self.texture_uniforms().into_iter().collect()
    }
}

/// Step `simulation` `steps` times.
pub fn run<C: ComputeContext, S: Simulation<C> + ?Sized>(
    simulation: &mut S,
    ctx: &mut C,
    steps: usize,
) -> Result<(), EngineError> {
    for _ in 0..steps {
        simulation.advance(ctx)?;
    }
    Ok(())
}
