use super::{clamp_or, mismatch, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::{param, AudioContext, FilterType, NativeId, NativeInput, NativeKind};
use crate::port::AudioEndpoint;
use crate::smooth::{SmoothCv, DEFAULT_SLEW_HZ};
use serde::{Deserialize, Serialize};

/// Cutoff Hz added per unit of `cutoff` CV
pub const CUTOFF_CV_HZ_PER_VOLT: f64 = 2000.0;

/// Resonance added per unit of `res` CV
pub const RESONANCE_CV_SCALE: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterState {
    pub filter_type: FilterType,
    pub cutoff: f64,
    pub resonance: f64,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            filter_type: FilterType::Lowpass,
            cutoff: 1000.0,
            resonance: 1.0,
        }
    }
}

/// Voltage-Controlled Filter
///
/// Manual cutoff and resonance glide through [`SmoothCv`]. CV inputs take a
/// separate raw path straight into the filter parameters so external
/// modulation is not lagged by the slew stage.
#[derive(Debug)]
pub struct Filter {
    filter: NativeId,
    cutoff: SmoothCv,
    resonance: SmoothCv,
    cutoff_cv: NativeId,
    resonance_cv: NativeId,
    state: FilterState,
}

impl Filter {
    pub fn new(ctx: &mut AudioContext) -> Self {
        let state = FilterState::default();

        let filter = ctx.create_filter(state.filter_type);
        ctx.set_intrinsic(filter, param::FREQUENCY, 0.0);
        ctx.set_intrinsic(filter, param::Q, 0.0);

        let cutoff = SmoothCv::new(ctx, state.cutoff, DEFAULT_SLEW_HZ);
        cutoff.connect(ctx, NativeInput::Param(filter, param::FREQUENCY));
        let resonance = SmoothCv::new(ctx, state.resonance, DEFAULT_SLEW_HZ);
        resonance.connect(ctx, NativeInput::Param(filter, param::Q));

        let cutoff_cv = ctx.create_gain(CUTOFF_CV_HZ_PER_VOLT);
        ctx.connect(cutoff_cv, NativeInput::Param(filter, param::FREQUENCY));
        let resonance_cv = ctx.create_gain(RESONANCE_CV_SCALE);
        ctx.connect(resonance_cv, NativeInput::Param(filter, param::Q));

        Self {
            filter,
            cutoff,
            resonance,
            cutoff_cv,
            resonance_cv,
            state,
        }
    }

    pub fn set_filter_type(&mut self, ctx: &mut AudioContext, filter_type: FilterType) {
        self.state.filter_type = filter_type;
        if let Some(node) = ctx.node_mut(self.filter) {
            node.kind = NativeKind::Filter { filter_type };
        }
    }

    pub fn set_cutoff(&mut self, ctx: &mut AudioContext, hz: f64) {
        self.state.cutoff = clamp_or(hz, 20.0, 20_000.0, self.state.cutoff);
        self.cutoff.set_value(ctx, self.state.cutoff);
    }

    pub fn set_resonance(&mut self, ctx: &mut AudioContext, q: f64) {
        self.state.resonance = clamp_or(q, 0.0, 30.0, self.state.resonance);
        self.resonance.set_value(ctx, self.state.resonance);
    }
}

impl ModularNode for Filter {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Filter
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.filter))
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.filter))
    }

    fn cv_input(&self, port: &str) -> Option<NativeInput> {
        match port {
            "cutoff" => Some(NativeInput::Node(self.cutoff_cv)),
            "res" => Some(NativeInput::Node(self.resonance_cv)),
            _ => None,
        }
    }

    fn state(&self) -> ModuleState {
        ModuleState::Filter(self.state.clone())
    }

    fn set_state(&mut self, ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Filter(state) = state else {
            return Err(mismatch(ModuleKind::Filter, &state));
        };
        self.set_filter_type(ctx, state.filter_type);
        self.set_cutoff(ctx, state.cutoff);
        self.set_resonance(ctx, state.resonance);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        self.cutoff.destroy(ctx);
        self.resonance.destroy(ctx);
        ctx.release(self.cutoff_cv);
        ctx.release(self.resonance_cv);
        ctx.release(self.filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, NativeFeatures};

    fn context() -> AudioContext {
        AudioContext::new(ManualClock::new(0.0), NativeFeatures::default())
    }

    #[test]
    fn test_manual_controls_are_smoothed() {
        let mut ctx = context();
        let mut filter = Filter::new(&mut ctx);
        filter.set_cutoff(&mut ctx, 5000.0);
        assert_eq!(filter.cutoff.value(), 5000.0);
        assert!(ctx.is_connected(
            filter.cutoff.target(),
            NativeInput::Param(filter.filter, param::FREQUENCY)
        ));
    }

    #[test]
    fn test_cv_path_bypasses_smoothing() {
        let mut ctx = context();
        let filter = Filter::new(&mut ctx);
        let Some(NativeInput::Node(raw)) = filter.cv_input("cutoff") else {
            panic!("cutoff cv missing");
        };
        assert!(ctx.is_connected(raw, NativeInput::Param(filter.filter, param::FREQUENCY)));
        let scale = ctx.param(raw, param::GAIN).map(|p| p.value_at(0.0));
        assert_eq!(scale, Some(CUTOFF_CV_HZ_PER_VOLT));
    }

    #[test]
    fn test_ranges_are_clamped() {
        let mut ctx = context();
        let mut filter = Filter::new(&mut ctx);
        filter.set_cutoff(&mut ctx, 1.0);
        filter.set_resonance(&mut ctx, 99.0);
        let ModuleState::Filter(state) = filter.state() else {
            panic!("wrong state kind");
        };
        assert_eq!(state.cutoff, 20.0);
        assert_eq!(state.resonance, 30.0);
    }

    #[test]
    fn test_filter_type_change() {
        let mut ctx = context();
        let mut filter = Filter::new(&mut ctx);
        filter.set_filter_type(&mut ctx, FilterType::Highpass);
        assert_eq!(
            ctx.node(filter.filter).map(|n| n.kind.clone()),
            Some(NativeKind::Filter {
                filter_type: FilterType::Highpass
            })
        );
    }
}
