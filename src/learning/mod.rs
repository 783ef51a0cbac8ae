//! Learning pipeline: task featurization, the reward function, and the
//! bounded experience buffer that feeds future adapter selection.

pub mod experience;
pub mod features;
pub mod reward;

pub use experience::{ActionRecord, Experience, ExperienceBuffer};
pub use features::{Complexity, Domain, Risk, TaskContext, TaskType};
pub use reward::{RewardContext, RewardOutcome, RewardResult, compute_reward};
