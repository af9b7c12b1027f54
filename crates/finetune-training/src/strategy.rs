//! Parameter-adaptation strategies.
//!
//! A strategy turns a loaded base model into a trainable variant. It only
//! talks to the [`ModelLibrary`]; it never records run state or metrics.

use crate::config::{RunConfig, StrategyKind};
use crate::error::{LibraryError, StrategyError, StrategyResult};
use crate::library::{LowRankSpec, ModelHandle, ModelLibrary, QuantizationSpec};

pub trait AdaptationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn apply(&self, library: &dyn ModelLibrary, base: ModelHandle) -> StrategyResult<ModelHandle>;
}

/// Builds the strategy selected by a run configuration.
#[must_use]
pub fn strategy_for(config: &RunConfig) -> Box<dyn AdaptationStrategy> {
    let low_rank = LowRankStrategy::new(LowRankSpec {
        rank: config.lora.r,
        alpha: config.lora.lora_alpha,
        dropout: config.lora.lora_dropout,
    });
    match config.strategy {
        StrategyKind::Lora => Box::new(low_rank),
        StrategyKind::Qlora => Box::new(QuantizedLowRankStrategy::new(
            QuantizationSpec {
                bits: config.quantization.bits,
                quant_type: config.quantization.quant_type.clone(),
                double_quant: config.quantization.double_quant,
                compute_dtype: config.quantization.compute_dtype.clone(),
            },
            low_rank,
        )),
    }
}

fn map_library_error(err: LibraryError) -> StrategyError {
    match err {
        LibraryError::Unsupported(reason) => StrategyError::UnsupportedModel(reason),
        other => StrategyError::Library(other),
    }
}

/// Low-rank adaptation: trainable rank-`r` updates over frozen base weights.
#[derive(Debug, Clone)]
pub struct LowRankStrategy {
    spec: LowRankSpec,
}

impl LowRankStrategy {
    #[must_use]
    pub fn new(spec: LowRankSpec) -> Self {
        Self { spec }
    }

    pub fn validate(&self) -> StrategyResult<()> {
        if self.spec.rank == 0 {
            return Err(StrategyError::InvalidRank(self.spec.rank));
        }
        if !self.spec.alpha.is_finite() || self.spec.alpha <= 0.0 {
            return Err(StrategyError::InvalidAlpha(self.spec.alpha));
        }
        if !(0.0..1.0).contains(&self.spec.dropout) {
            return Err(StrategyError::InvalidDropout(self.spec.dropout));
        }
        Ok(())
    }
}

impl AdaptationStrategy for LowRankStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lora
    }

    fn apply(&self, library: &dyn ModelLibrary, base: ModelHandle) -> StrategyResult<ModelHandle> {
        self.validate()?;
        let adapted = library.attach_low_rank(base, &self.spec).map_err(map_library_error)?;
        if !adapted.base_frozen {
            return Err(StrategyError::UnsupportedModel(format!(
                "{}: base weights could not be frozen",
                adapted.reference
            )));
        }
        Ok(adapted)
    }
}

/// Quantized low-rank adaptation: reduce precision first, then wrap.
#[derive(Debug, Clone)]
pub struct QuantizedLowRankStrategy {
    quantization: QuantizationSpec,
    low_rank: LowRankStrategy,
}

impl QuantizedLowRankStrategy {
    #[must_use]
    pub fn new(quantization: QuantizationSpec, low_rank: LowRankStrategy) -> Self {
        Self { quantization, low_rank }
    }

    pub fn validate(&self) -> StrategyResult<()> {
        let q = &self.quantization;
        match q.bits {
            4 => {
                if !matches!(q.quant_type.as_str(), "nf4" | "fp4") {
                    return Err(StrategyError::InvalidQuantization(format!(
                        "4-bit quant_type must be nf4 or fp4, got {}",
                        q.quant_type
                    )));
                }
            }
            8 => {}
            other => {
                return Err(StrategyError::InvalidQuantization(format!(
                    "bits must be 4 or 8, got {other}"
                )));
            }
        }
        if !matches!(q.compute_dtype.as_str(), "float16" | "bfloat16" | "float32") {
            return Err(StrategyError::InvalidQuantization(format!(
                "unsupported compute_dtype {}",
                q.compute_dtype
            )));
        }
        self.low_rank.validate()
    }
}

impl AdaptationStrategy for QuantizedLowRankStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Qlora
    }

    fn apply(&self, library: &dyn ModelLibrary, base: ModelHandle) -> StrategyResult<ModelHandle> {
        self.validate()?;
        let quantized = library.quantize(base, &self.quantization).map_err(map_library_error)?;
        self.low_rank.apply(library, quantized)
    }
}
