//! The stage processors of the standard pipeline.
//!
//! | Stage        | Processor                | Model calls | Side effects                    |
//! |--------------|--------------------------|-------------|---------------------------------|
//! | `preprocess` | [`PreprocessProcessor`]  | none        | none                            |
//! | `screen`     | [`ScreenProcessor`]      | one         | none                            |
//! | `analyze`    | [`AnalyzeProcessor`]     | one or two  | may download the full text      |
//! | `report`     | [`ReportProcessor`]      | none        | none                            |
//!
//! The only side effect, a download, is content addressed and recorded on the record, so a
//! processor invoked twice with the same record converges on the same result.

use super::*;
use crate::{
  chain::AcquisitionChain,
  config::PipelineConfig,
  llm::LanguageModel,
  stage::{Stage, StageProcessor},
};

pub mod analyze;
pub mod preprocess;
pub mod report;
pub mod screen;

pub use self::{
  analyze::AnalyzeProcessor, preprocess::PreprocessProcessor, report::ReportProcessor,
  screen::ScreenProcessor,
};

/// Builds the processors for `stages`.
///
/// `llm` is required when a selected stage calls the model. `chain` is only used by the analyze
/// stage, and only when deep analysis is enabled.
pub fn build(
  stages: &[Stage],
  config: &PipelineConfig,
  llm: Option<Arc<dyn LanguageModel>>,
  chain: Option<Arc<AcquisitionChain>>,
) -> Result<Vec<Arc<dyn StageProcessor>>> {
  let model = |stage: Stage| {
    llm.clone().ok_or_else(|| {
      SifterError::Config(format!("stage '{stage}' needs a language model but none is configured"))
    })
  };

  stages
    .iter()
    .map(|&stage| -> Result<Arc<dyn StageProcessor>> {
      Ok(match stage {
        Stage::Preprocess => Arc::new(PreprocessProcessor),
        Stage::Screen => Arc::new(ScreenProcessor::new(model(stage)?, config)),
        Stage::Analyze => {
          let mut processor = AnalyzeProcessor::new(model(stage)?, config);
          if let Some(chain) = chain.clone() {
            processor = processor.with_chain(chain);
          }
          Arc::new(processor)
        },
        Stage::Report => Arc::new(ReportProcessor),
      })
    })
    .collect()
}
