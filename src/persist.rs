// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session bundles: caches, edit log and checkpoint history in one
//! safetensors file.
//!
//! A bundle has four fields in fixed order, each stored under its own key
//! prefix:
//!
//! | # | field | keys |
//! |---|-------|------|
//! | 0 | harmful store | `harmful.{hook}` |
//! | 1 | harmless store | `harmless.{hook}` |
//! | 2 | modification log | `log.{kind}.{layer}.{idx}.{previous,replacement}` |
//! | 3 | checkpoints | `checkpoint.{n}.created_at`, `checkpoint.{n}.{kind}.{layer}.{idx}.{...}` |
//!
//! The `__fields__` tensor (`u8`, one flag per field) marks which fields
//! are present; an absent field is the empty marker. Refusal labels, when
//! recorded, ride along as `labels.harmful` / `labels.harmless`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use candle_core::{DType, Device, Tensor};

use crate::abliterator::AbliterationContext;
use crate::cache::ActivationStore;
use crate::checkpoint::{Checkpoint, ParamSnapshot, detach_to_cpu};
use crate::error::{AbliterationError, Result};
use crate::hooks::HookPoint;
use crate::surgery::{ModificationLog, WeightEdit, WeightKind};

/// Key of the presence flags.
const FIELDS_KEY: &str = "__fields__";

/// Number of bundle fields.
const NUM_FIELDS: usize = 4;

/// Field prefixes, in bundle order.
const FIELD_PREFIXES: [&str; NUM_FIELDS] = ["harmful", "harmless", "log", "checkpoint"];

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Write every record of `store` under `prefix`.
fn encode_store(
    tensors: &mut HashMap<String, Tensor>,
    prefix: &str,
    store: &ActivationStore,
) -> Result<()> {
    for (site, record) in store.iter() {
        tensors.insert(format!("{prefix}.{site}"), detach_to_cpu(record)?);
    }
    Ok(())
}

/// Write every edit of `log` under `prefix`.
fn encode_log(tensors: &mut HashMap<String, Tensor>, prefix: &str, log: &ModificationLog) {
    for (kind, layer, edits) in log.iter() {
        for (idx, edit) in edits.iter().enumerate() {
            let key = format!("{prefix}.{kind}.{layer}.{idx}");
            // BORROW: explicit .clone(): logged tensors are shared, not copied
            tensors.insert(format!("{key}.previous"), edit.previous.clone());
            tensors.insert(format!("{key}.replacement"), edit.replacement.clone());
        }
    }
}

/// `[seconds, nanoseconds]` since the Unix epoch.
fn encode_time(time: SystemTime) -> Result<Tensor> {
    let since_epoch = time
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AbliterationError::Bundle(format!("checkpoint predates the epoch: {e}")))?;
    let secs = i64::try_from(since_epoch.as_secs())
        .map_err(|_| AbliterationError::Bundle("checkpoint time out of range".into()))?;
    let nanos = i64::from(since_epoch.subsec_nanos());
    Ok(Tensor::new(&[secs, nanos], &Device::Cpu)?)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Records found under `prefix.`.
fn decode_store(tensors: &HashMap<String, Tensor>, prefix: &str) -> ActivationStore {
    let prefix = format!("{prefix}.");
    let mut store = ActivationStore::new();
    for (key, tensor) in tensors {
        if let Some(site) = key.strip_prefix(&prefix) {
            // BORROW: explicit .clone(): the loaded map is dropped after decoding
            store.insert(HookPoint::from(site), tensor.clone());
        }
    }
    store
}

/// Halves of one edit while decoding.
#[derive(Default)]
struct PartialEdit {
    /// Matrix before the write.
    previous: Option<Tensor>,
    /// Matrix written.
    replacement: Option<Tensor>,
}

/// Parse `{kind}.{layer}.{idx}.{half}`.
fn parse_edit_key(rest: &str) -> Result<(WeightKind, usize, usize, &str)> {
    let malformed = || AbliterationError::Bundle(format!("malformed edit key `{rest}`"));
    let mut parts = rest.split('.');
    let (Some(kind), Some(layer), Some(idx), Some(half), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(malformed());
    };
    let kind: WeightKind = kind.parse()?;
    let layer: usize = layer.parse().map_err(|_| malformed())?;
    let idx: usize = idx.parse().map_err(|_| malformed())?;
    Ok((kind, layer, idx, half))
}

/// Log stored under `prefix.`; edit indices must run `0..n` per
/// `(kind, layer)`.
fn decode_log(tensors: &HashMap<String, Tensor>, prefix: &str) -> Result<ModificationLog> {
    let prefix = format!("{prefix}.");
    let mut partial: BTreeMap<(WeightKind, usize, usize), PartialEdit> = BTreeMap::new();
    for (key, tensor) in tensors {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };
        if rest == "created_at" {
            continue;
        }
        let (kind, layer, idx, half) = parse_edit_key(rest)?;
        let slot = partial.entry((kind, layer, idx)).or_default();
        match half {
            // BORROW: explicit .clone(): the loaded map is dropped after decoding
            "previous" => slot.previous = Some(tensor.clone()),
            "replacement" => slot.replacement = Some(tensor.clone()),
            other => {
                return Err(AbliterationError::Bundle(format!(
                    "unknown edit half `{other}` in `{key}`"
                )));
            }
        }
    }

    let mut log = ModificationLog::new();
    for ((kind, layer, idx), edit) in partial {
        if log.edits(kind, layer).len() != idx {
            return Err(AbliterationError::Bundle(format!(
                "edit {idx} of {kind} at layer {layer} has missing predecessors"
            )));
        }
        let (Some(previous), Some(replacement)) = (edit.previous, edit.replacement) else {
            return Err(AbliterationError::Bundle(format!(
                "edit {idx} of {kind} at layer {layer} is incomplete"
            )));
        };
        log.record(
            kind,
            layer,
            WeightEdit {
                previous,
                replacement,
            },
        );
    }
    Ok(log)
}

/// Inverse of [`encode_time`].
fn decode_time(tensor: &Tensor) -> Result<SystemTime> {
    let values = tensor.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    let [secs, nanos] = values.as_slice() else {
        return Err(AbliterationError::Bundle(format!(
            "checkpoint time must hold 2 values, got {}",
            values.len()
        )));
    };
    let secs = u64::try_from(*secs)
        .map_err(|_| AbliterationError::Bundle("negative checkpoint time".into()))?;
    let nanos = u32::try_from(*nanos)
        .map_err(|_| AbliterationError::Bundle("invalid checkpoint nanoseconds".into()))?;
    Ok(UNIX_EPOCH + Duration::new(secs, nanos))
}

/// Checkpoints `0..n`, each needing a `created_at` entry.
fn decode_checkpoints(tensors: &HashMap<String, Tensor>) -> Result<Vec<Checkpoint>> {
    let mut count = 0;
    for key in tensors.keys() {
        if let Some(rest) = key.strip_prefix("checkpoint.") {
            let index = rest
                .split('.')
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| AbliterationError::Bundle(format!("malformed checkpoint key `{key}`")))?;
            count = count.max(index + 1);
        }
    }

    (0..count)
        .map(|n| {
            let prefix = format!("checkpoint.{n}");
            let created_at = tensors.get(&format!("{prefix}.created_at")).ok_or_else(|| {
                AbliterationError::Bundle(format!("checkpoint {n} has no creation time"))
            })?;
            Ok(Checkpoint::from_parts(
                decode_time(created_at)?,
                decode_log(tensors, &prefix)?,
            ))
        })
        .collect()
}

/// Presence flags, one per field.
fn decode_fields(tensors: &HashMap<String, Tensor>) -> Result<[bool; NUM_FIELDS]> {
    let flags = tensors
        .get(FIELDS_KEY)
        .ok_or_else(|| AbliterationError::Bundle(format!("missing `{FIELDS_KEY}` entry")))?
        .to_dtype(DType::U8)?
        .to_vec1::<u8>()?;
    let mut present = [false; NUM_FIELDS];
    if flags.len() != NUM_FIELDS {
        return Err(AbliterationError::Bundle(format!(
            "expected {NUM_FIELDS} field flags, got {}",
            flags.len()
        )));
    }
    for (slot, flag) in present.iter_mut().zip(flags) {
        *slot = flag != 0;
    }
    Ok(present)
}

/// Fail when a field's presence flag disagrees with its contents.
fn check_presence(field: usize, flagged: bool, found: bool) -> Result<()> {
    if flagged == found {
        return Ok(());
    }
    let name = FIELD_PREFIXES.get(field).copied().unwrap_or("?");
    Err(AbliterationError::Bundle(if flagged {
        format!("field `{name}` is flagged present but has no entries")
    } else {
        format!("field `{name}` is flagged empty but has entries")
    }))
}

/// Label vector under `key`, empty when absent.
fn decode_labels(tensors: &HashMap<String, Tensor>, key: &str) -> Result<Vec<f32>> {
    tensors.get(key).map_or_else(
        || Ok(Vec::new()),
        |t| Ok(t.to_dtype(DType::F32)?.to_vec1::<f32>()?),
    )
}

// ---------------------------------------------------------------------------
// Context operations
// ---------------------------------------------------------------------------

impl AbliterationContext {
    /// Write caches, edit log and checkpoint history to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Model`] if the file cannot be written.
    pub fn save_session(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors = HashMap::new();
        encode_store(&mut tensors, "harmful", &self.harmful)?;
        encode_store(&mut tensors, "harmless", &self.harmless)?;
        encode_log(&mut tensors, "log", &self.log);
        for (n, checkpoint) in self.checkpoints.iter().enumerate() {
            let prefix = format!("checkpoint.{n}");
            tensors.insert(format!("{prefix}.created_at"), encode_time(checkpoint.created_at())?);
            encode_log(&mut tensors, &prefix, checkpoint.log());
        }
        for (key, labels) in [
            ("labels.harmful", &self.harmful_labels),
            ("labels.harmless", &self.harmless_labels),
        ] {
            if !labels.is_empty() {
                tensors.insert(key.to_string(), Tensor::from_slice(labels.as_slice(), labels.len(), &Device::Cpu)?);
            }
        }

        let flags: Vec<u8> = [
            !self.harmful.is_empty(),
            !self.harmless.is_empty(),
            !self.log.is_empty(),
            !self.checkpoints.is_empty(),
        ]
        .into_iter()
        .map(u8::from)
        .collect();
        tensors.insert(FIELDS_KEY.to_string(), Tensor::from_vec(flags, NUM_FIELDS, &Device::Cpu)?);

        candle_core::safetensors::save(&tensors, path.as_ref())?;
        tracing::info!(
            path = %path.as_ref().display(),
            tensors = tensors.len(),
            "session saved"
        );
        Ok(())
    }

    /// Replace caches, edit log and checkpoints with those saved at
    /// `path`, and bring the weights to the state the log describes.
    ///
    /// Weights are first restored to the originals, then the last
    /// replacement of every logged `(kind, layer)` is written back.
    /// The blacklist is not consulted. Nothing changes when decoding fails.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Bundle`] for a malformed bundle
    /// (activations whose width differs from the model's, or edits whose
    /// shape differs from the weight they target), and propagates read and
    /// weight-write errors. Weights are rolled back if a write fails.
    pub fn load_session(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.scoped {
            tracing::warn!("loading a session inside a modification scope");
        }
        let tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;
        let present = decode_fields(&tensors)?;

        let harmful = decode_store(&tensors, "harmful");
        let harmless = decode_store(&tensors, "harmless");
        let log = decode_log(&tensors, "log")?;
        let checkpoints = decode_checkpoints(&tensors)?;
        let found = [
            !harmful.is_empty(),
            !harmless.is_empty(),
            !log.is_empty(),
            !checkpoints.is_empty(),
        ];
        for (field, (&flagged, found)) in present.iter().zip(found).enumerate() {
            check_presence(field, flagged, found)?;
        }

        let hidden = self.backend.hidden_size();
        for store in [&harmful, &harmless] {
            for (site, record) in store.iter() {
                if record.rank() != 2 || record.dim(1)? != hidden {
                    return Err(AbliterationError::Bundle(format!(
                        "activations at {site} have shape {:?}, model width is {hidden}",
                        record.dims()
                    )));
                }
            }
        }
        for (kind, layer, edits) in log.iter() {
            self.check_layer(layer)
                .map_err(|e| AbliterationError::Bundle(format!("{kind} edit: {e}")))?;
            let expected = self.backend.weight(layer, kind)?;
            for edit in edits {
                for tensor in [&edit.previous, &edit.replacement] {
                    if tensor.dims() != expected.dims() {
                        return Err(AbliterationError::Bundle(format!(
                            "{kind} edit at layer {layer} has shape {:?}, weight is {:?}",
                            tensor.dims(),
                            expected.dims()
                        )));
                    }
                }
            }
        }

        let harmful_labels = decode_labels(&tensors, "labels.harmful")?;
        let harmless_labels = decode_labels(&tensors, "labels.harmless")?;

        let current = ParamSnapshot::capture(self.backend.as_ref())?;
        if let Err(e) = self.replay_last_edits(&log) {
            current.restore_into(self.backend.as_mut())?;
            return Err(e);
        }

        self.harmful_labels = harmful_labels;
        self.harmless_labels = harmless_labels;
        self.harmful = harmful;
        self.harmless = harmless;
        self.modified = !log.is_empty();
        self.log = log;
        self.checkpoints = checkpoints;
        tracing::info!(
            path = %path.as_ref().display(),
            edits = self.log.num_edits(),
            checkpoints = self.checkpoints.len(),
            "session loaded"
        );
        Ok(())
    }

    /// Restore the original weights, then write the last replacement of
    /// every `(kind, layer)` in `log`.
    fn replay_last_edits(&mut self, log: &ModificationLog) -> Result<()> {
        self.original.restore_into(self.backend.as_mut())?;
        for (kind, layer, edits) in log.iter() {
            if let Some(last) = edits.last() {
                let current = self.backend.weight(layer, kind)?;
                let value = last
                    .replacement
                    .to_device(current.device())?
                    .to_dtype(current.dtype())?;
                self.backend.set_weight(layer, kind, value)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn matrix(value: f32) -> Tensor {
        Tensor::from_vec(vec![value; 4], (2, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn edit_keys_parse() {
        let (kind, layer, idx, half) = parse_edit_key("mlp_out.3.1.previous").unwrap();
        assert_eq!(kind, WeightKind::MlpOut);
        assert_eq!((layer, idx, half), (3, 1, "previous"));
        assert!(parse_edit_key("mlp_out.3.previous").is_err());
        assert!(parse_edit_key("bogus.3.0.previous").is_err());
        assert!(parse_edit_key("attn_out.x.0.previous").is_err());
    }

    #[test]
    fn log_survives_encoding() {
        let mut log = ModificationLog::new();
        for value in [1.0, 2.0] {
            log.record(
                WeightKind::AttnOut,
                2,
                WeightEdit {
                    previous: matrix(value),
                    replacement: matrix(value + 1.0),
                },
            );
        }
        let mut tensors = HashMap::new();
        encode_log(&mut tensors, "log", &log);
        assert_eq!(tensors.len(), 4);

        let decoded = decode_log(&tensors, "log").unwrap();
        let edits = decoded.edits(WeightKind::AttnOut, 2);
        assert_eq!(edits.len(), 2);
        let second: Vec<f32> = edits[1].replacement.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(second, vec![3.0; 4]);
    }

    #[test]
    fn gaps_and_halves_are_rejected() {
        let mut tensors = HashMap::new();
        tensors.insert("log.attn_out.1.1.previous".to_string(), matrix(0.0));
        tensors.insert("log.attn_out.1.1.replacement".to_string(), matrix(0.0));
        assert!(matches!(
            decode_log(&tensors, "log"),
            Err(AbliterationError::Bundle(_))
        ));

        let mut tensors = HashMap::new();
        tensors.insert("log.attn_out.1.0.previous".to_string(), matrix(0.0));
        assert!(matches!(
            decode_log(&tensors, "log"),
            Err(AbliterationError::Bundle(_))
        ));
    }

    #[test]
    fn checkpoint_time_round_trips() {
        let time = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        assert_eq!(decode_time(&encode_time(time).unwrap()).unwrap(), time);
    }

    #[test]
    fn checkpoints_need_creation_time() {
        let mut tensors = HashMap::new();
        tensors.insert("checkpoint.0.mlp_out.1.0.previous".to_string(), matrix(0.0));
        tensors.insert("checkpoint.0.mlp_out.1.0.replacement".to_string(), matrix(1.0));
        assert!(decode_checkpoints(&tensors).is_err());

        tensors.insert("checkpoint.0.created_at".to_string(), encode_time(UNIX_EPOCH).unwrap());
        let checkpoints = decode_checkpoints(&tensors).unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].log().num_edits(), 1);
    }

    #[test]
    fn field_flags_are_checked() {
        let mut tensors = HashMap::new();
        assert!(decode_fields(&tensors).is_err());
        tensors.insert(
            FIELDS_KEY.to_string(),
            Tensor::from_vec(vec![1_u8, 0, 1, 0], 4, &Device::Cpu).unwrap(),
        );
        assert_eq!(decode_fields(&tensors).unwrap(), [true, false, true, false]);
        assert!(check_presence(0, true, false).is_err());
        assert!(check_presence(1, false, true).is_err());
        assert!(check_presence(2, true, true).is_ok());
    }

    #[test]
    fn stores_decode_by_prefix() {
        let mut tensors = HashMap::new();
        tensors.insert("harmful.blocks.1.hook_resid_post".to_string(), matrix(1.0));
        tensors.insert("harmless.blocks.1.hook_resid_post".to_string(), matrix(2.0));
        let store = decode_store(&tensors, "harmful");
        assert_eq!(store.len(), 1);
        assert!(store.contains(&HookPoint::from("blocks.1.hook_resid_post")));
    }
}
