//! Detector error models, shot sampling and decoders.
//!
//! The runner treats these as capabilities: a [`Sampler`] draws shots of a
//! circuit and a [`CompiledDecoder`] predicts observable flips from
//! detection events. Decoders are looked up by name in a
//! [`DecoderRegistry`].

pub mod decoder;
pub mod dem;
pub mod sampler;
pub mod shots;

pub use decoder::{
    predict_observables, CompiledDecoder, DecodeError, Decoder, DecoderRegistry, GreedyDecoder,
    VacuousDecoder,
};
pub use dem::{DemError, DetectorErrorModel, ErrorMechanism, MAX_OBSERVABLES};
pub use sampler::{DemSampler, Sampler, Shot};
pub use shots::{read_detection_events, write_predictions, FormatError, ShotFormat};
