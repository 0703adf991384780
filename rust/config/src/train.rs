//! Trainer hyperparameters and their command-line rendering.

use serde::{Deserialize, Serialize};

use crate::{ModelId, Optimiser, TrainingMode, format_float};

/// Logging switches forwarded to the trainer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub tensorboard: bool,
    #[serde(default = "default_true")]
    pub filelogger: bool,
    /// Batches between validation passes. Absent leaves the trainer's default.
    #[serde(default)]
    pub log_interval: Option<usize>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            tensorboard: true,
            filelogger: true,
            log_interval: None,
        }
    }
}

/// Learning-rate schedule and checkpointing options.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Step decay at fixed epochs (MultiStepLR).
    #[serde(default)]
    pub lr_scheduler: bool,
    #[serde(default)]
    pub lr_schedule: Vec<usize>,
    #[serde(default)]
    pub lr_decay_factor: Option<f64>,
    #[serde(default)]
    pub checkpoint_save_interval: Option<usize>,
}

/// Full set of trainer parameters for one run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainParams {
    pub model: ModelId,
    #[serde(default)]
    pub training_mode: Option<TrainingMode>,
    /// Ask the trainer for a subset even without an explicit size.
    #[serde(default)]
    pub not_full_data: bool,
    /// Number of training examples. Absent means the whole dataset.
    #[serde(default)]
    pub train_data_size: Option<usize>,
    pub batch_size: usize,
    pub epochs: usize,
    #[serde(default)]
    pub data_aug: bool,
    pub optimiser: Optimiser,
    pub learning_rate: f64,
    /// Reduce the learning rate when validation loss plateaus.
    #[serde(default = "default_true")]
    pub lr_reducer: bool,
    #[serde(default)]
    pub weight_decay: Option<f64>,
    #[serde(default)]
    pub momentum: Option<f64>,
    #[serde(default, flatten)]
    pub logging: LoggingConfig,
    #[serde(default, flatten)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Evaluate this checkpoint on the test split instead of training.
    #[serde(default)]
    pub eval_checkpoint: Option<String>,
    /// Appended verbatim after every other flag.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl TrainParams {
    /// Every key accepted in a serialized parameter table, flattened
    /// sections included.
    pub const FIELDS: &'static [&'static str] = &[
        "model",
        "training_mode",
        "not_full_data",
        "train_data_size",
        "batch_size",
        "epochs",
        "data_aug",
        "optimiser",
        "learning_rate",
        "lr_reducer",
        "weight_decay",
        "momentum",
        "tensorboard",
        "filelogger",
        "log_interval",
        "lr_scheduler",
        "lr_schedule",
        "lr_decay_factor",
        "checkpoint_save_interval",
        "seed",
        "eval_checkpoint",
        "extra_args",
    ];

    /// Minimal parameters; everything optional takes its default.
    pub fn new(
        model: ModelId,
        batch_size: usize,
        epochs: usize,
        optimiser: Optimiser,
        learning_rate: f64,
    ) -> Self {
        Self {
            model,
            training_mode: None,
            not_full_data: false,
            train_data_size: None,
            batch_size,
            epochs,
            data_aug: false,
            optimiser,
            learning_rate,
            lr_reducer: true,
            weight_decay: None,
            momentum: None,
            logging: LoggingConfig::default(),
            schedule: ScheduleConfig::default(),
            seed: None,
            eval_checkpoint: None,
            extra_args: Vec::new(),
        }
    }

    /// True when the trainer will use its entire training split.
    pub fn uses_full_data(&self) -> bool {
        !self.not_full_data && self.train_data_size.is_none()
    }

    /// Convert to trainer arguments for subprocess invocation.
    ///
    /// Order is fixed so identical parameters always render identically.
    pub fn to_cli_args(&self, exp_name: &str) -> Vec<String> {
        let mut args = vec!["--model".into(), self.model.to_string()];
        if let Some(mode) = self.training_mode {
            args.extend(["--training-mode".into(), mode.to_string()]);
        }
        if self.not_full_data {
            args.push("--not-full-data".into());
        }
        if let Some(size) = self.train_data_size {
            args.extend(["--train-data-size".into(), size.to_string()]);
        }
        args.extend([
            "--batch-size".into(),
            self.batch_size.to_string(),
            "--epochs".into(),
            self.epochs.to_string(),
        ]);
        if self.data_aug {
            args.push("--data-aug".into());
        }
        args.extend([
            "--optimiser".into(),
            self.optimiser.to_string(),
            "--learning-rate".into(),
            format_float(self.learning_rate),
        ]);
        if self.lr_reducer {
            args.push("--lr-reducer".into());
        }
        if let Some(wd) = self.weight_decay {
            args.extend(["--weight-decay".into(), format_float(wd)]);
        }
        args.extend(["--exp-name".into(), exp_name.to_string()]);
        if self.logging.tensorboard {
            args.push("--tensorboard".into());
        }
        if let Some(interval) = self.logging.log_interval {
            args.extend(["--log-interval".into(), interval.to_string()]);
        }
        if self.logging.filelogger {
            args.push("--filelogger".into());
        }

        if let Some(momentum) = self.momentum {
            args.extend(["--momentum".into(), format_float(momentum)]);
        }
        if self.schedule.lr_scheduler {
            args.push("--lr-scheduler".into());
        }
        if !self.schedule.lr_schedule.is_empty() {
            args.push("--lr-schedule".into());
            args.extend(self.schedule.lr_schedule.iter().map(ToString::to_string));
        }
        if let Some(factor) = self.schedule.lr_decay_factor {
            args.extend(["--lr-decay-factor".into(), format_float(factor)]);
        }
        if let Some(interval) = self.schedule.checkpoint_save_interval {
            args.extend(["--checkpoint-save-interval".into(), interval.to_string()]);
        }
        if let Some(seed) = self.seed {
            args.extend(["--seed".into(), seed.to_string()]);
        }
        if let Some(ref checkpoint) = self.eval_checkpoint {
            args.extend(["--eval".into(), "--eval-checkpoint".into(), checkpoint.clone()]);
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}
