//! Recognizer behavior over deterministic mock backends.

mod common;

use common::*;
use melops_decode::decoding::{DecodingStrategy, WhisperDecoder};
use melops_decode::error::{BackendError, Error, PreconditionError};
use melops_decode::{DecodingMethod, RecognitionResult, Recognizer, Stream};
use std::sync::atomic::Ordering;

/// Decode a stream until it has no ready input.
fn drain<S: DecodingStrategy>(recognizer: &mut Recognizer<S>, stream: &mut Stream<S::State>) {
    while recognizer.is_ready(stream) {
        recognizer.decode_one(stream).expect("decode");
    }
}

/// Push `ids`, finish input and decode everything.
fn recognize<S: DecodingStrategy>(
    recognizer: &mut Recognizer<S>,
    ids: &[usize],
) -> RecognitionResult {
    let mut stream = recognizer.create_stream();
    stream.accept_features(frames(ids).view()).expect("features");
    stream.input_finished();
    drain(recognizer, &mut stream);
    recognizer.result(&stream)
}

/// Decode each stream alone on one recognizer and all streams batched on
/// another, then compare results.
fn assert_batch_matches_single<S: DecodingStrategy>(
    mut single: Recognizer<S>,
    mut batched: Recognizer<S>,
    inputs: &[&[usize]],
) {
    let expected: Vec<RecognitionResult> = inputs
        .iter()
        .map(|ids| recognize(&mut single, ids))
        .collect();

    let mut streams: Vec<Stream<S::State>> = inputs
        .iter()
        .map(|ids| {
            let mut stream = batched.create_stream();
            stream.accept_features(frames(ids).view()).expect("features");
            stream.input_finished();
            stream
        })
        .collect();

    while batched.decode_ready(&mut streams).expect("batch decode") > 0 {}

    let got: Vec<RecognitionResult> = streams.iter().map(|s| batched.result(s)).collect();
    assert_eq!(got, expected);
}

const UTTERANCES: [&[usize]; 3] = [&[1, 1, 0, 2, 2, 3], &[3, 0, 3, 3], &[2, 1, 0, 0, 1, 2, 3, 3, 0]];

#[test]
fn greedy_transducer_streams_tokens_with_timestamps() {
    let mut recognizer =
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch);

    let result = recognize(&mut recognizer, &[1, 1, 0, 2, 2, 3]);

    assert_eq!(result.text, "a bc");
    assert_eq!(result.token_ids, vec![1, 2, 3]);
    assert_eq!(result.timestamps.len(), 3);
    assert!((result.timestamps[1] - 0.3).abs() < 1e-5);
    assert!((result.timestamps[2] - 0.5).abs() < 1e-5);
    assert!(result.is_final);
}

#[test]
fn beam_search_finds_greedy_path() {
    let mut greedy =
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch);
    let mut beam = transducer_recognizer(
        MockTransducer::streaming(2, 1),
        DecodingMethod::ModifiedBeamSearch,
    );

    for ids in UTTERANCES {
        assert_eq!(recognize(&mut beam, ids).text, recognize(&mut greedy, ids).text);
    }
}

#[test]
fn result_read_is_idempotent() {
    let mut recognizer =
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch);
    let mut stream = recognizer.create_stream();
    stream.accept_features(frames(&[1, 2, 0]).view()).unwrap();
    drain(&mut recognizer, &mut stream);

    let first = recognizer.result(&stream);
    let second = recognizer.result(&stream);

    assert_eq!(first, second);
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    assert!(!first.is_final);
}

#[test]
fn result_json_has_canonical_keys() {
    let mut recognizer = ctc_recognizer(MockCtc::offline());
    let result = recognize(&mut recognizer, &[1, 0, 2]);

    let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();

    assert_eq!(json["text"], "a b");
    assert_eq!(json["tokens"], serde_json::json!(["▁a", "▁b"]));
    assert_eq!(json["segment"], 0);
    assert_eq!(json["is_final"], true);
    assert!(json["timestamps"].is_array());
    assert!(json.get("token_ids").is_none());
}

#[test]
fn greedy_batch_matches_single() {
    assert_batch_matches_single(
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch),
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch),
        &UTTERANCES,
    );
}

#[test]
fn beam_batch_matches_single() {
    let method = DecodingMethod::ModifiedBeamSearch;
    assert_batch_matches_single(
        transducer_recognizer(MockTransducer::streaming(3, 2), method),
        transducer_recognizer(MockTransducer::streaming(3, 2), method),
        &UTTERANCES,
    );
}

#[test]
fn ctc_batch_matches_single() {
    assert_batch_matches_single(
        ctc_recognizer(MockCtc::streaming(3, 2)),
        ctc_recognizer(MockCtc::streaming(3, 2)),
        &UTTERANCES,
    );
    assert_batch_matches_single(
        ctc_recognizer(MockCtc::offline()),
        ctc_recognizer(MockCtc::offline()),
        &UTTERANCES,
    );
}

#[test]
fn whisper_batch_matches_single() {
    assert_batch_matches_single(
        whisper_recognizer(MockWhisper::new(8, Some(2))),
        whisper_recognizer(MockWhisper::new(8, Some(2))),
        &[&[1, 0], &[2], &[3, 3, 3]],
    );
}

#[test]
fn endpoint_rule1_fires_at_threshold() {
    // 0.5s of trailing silence at 0.1s per frame
    let mut recognizer =
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch);
    let mut stream = recognizer.create_stream();

    stream.accept_features(frames(&[1, 0, 0, 0, 0, 0]).view()).unwrap();
    drain(&mut recognizer, &mut stream);
    assert_eq!(stream.endpoint().state().trailing_silence_since_last_token, 4);
    assert!(!recognizer.is_endpoint(&stream));

    stream.accept_features(frames(&[0]).view()).unwrap();
    drain(&mut recognizer, &mut stream);
    assert_eq!(stream.endpoint().state().trailing_silence_since_last_token, 5);
    assert!(recognizer.is_endpoint(&stream));
}

#[test]
fn endpoint_rule2_fires_without_tokens() {
    let mut recognizer =
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch);
    let mut stream = recognizer.create_stream();

    stream.accept_features(frames(&[0, 0, 0]).view()).unwrap();
    drain(&mut recognizer, &mut stream);
    assert!(!recognizer.is_endpoint(&stream));

    stream.accept_features(frames(&[0]).view()).unwrap();
    drain(&mut recognizer, &mut stream);
    assert!(recognizer.is_endpoint(&stream));
}

#[test]
fn endpoint_rule3_fires_during_continuous_speech() {
    let mut recognizer =
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch);
    let mut stream = recognizer.create_stream();
    stream
        .accept_features(frames(&[1, 2, 1, 2, 1, 2, 1, 2, 1, 2, 1]).view())
        .unwrap();

    for _ in 0..9 {
        recognizer.decode_one(&mut stream).unwrap();
    }
    assert_eq!(stream.endpoint().state().trailing_silence_since_last_token, 0);
    assert!(!recognizer.is_endpoint(&stream));

    recognizer.decode_one(&mut stream).unwrap();
    assert!(recognizer.is_endpoint(&stream));
}

#[test]
fn reset_starts_new_segment() {
    let mut recognizer =
        transducer_recognizer(MockTransducer::streaming(2, 1), DecodingMethod::GreedySearch);
    let mut stream = recognizer.create_stream();
    stream.accept_features(frames(&[1, 0, 0, 0, 0, 0, 0]).view()).unwrap();
    drain(&mut recognizer, &mut stream);
    assert!(recognizer.is_endpoint(&stream));

    recognizer.reset(&mut stream).unwrap();

    assert!(!recognizer.is_endpoint(&stream));
    assert_eq!(recognizer.result(&stream).text, "");

    stream.accept_features(frames(&[2, 0]).view()).unwrap();
    drain(&mut recognizer, &mut stream);
    let result = recognizer.result(&stream);

    assert_eq!(result.text, "b");
    assert_eq!(result.segment, 1);
    // 6 input frames consumed at 10ms each
    assert!((result.start_time - 0.06).abs() < 1e-5);
    // Relative to the segment start: the unconsumed silence frame comes first
    assert!((result.timestamps[0] - 0.1).abs() < 1e-5);
}

#[test]
fn beam_width_follows_config() {
    let greedy = config(DecodingMethod::GreedySearch);
    let mut beam = config(DecodingMethod::ModifiedBeamSearch);
    beam.max_active_paths = 6;

    let search = |config| {
        melops_decode::decoding::TransducerSearch::new(MockTransducer::streaming(2, 1), config)
    };

    assert_eq!(search(&greedy).beam(), 1);
    assert_eq!(search(&beam).beam(), 6);
    assert_eq!(search(&beam).method(), DecodingMethod::ModifiedBeamSearch);
}

#[test]
fn endpoint_disabled_never_fires() {
    let mut config = config(DecodingMethod::GreedySearch);
    config.enable_endpoint = false;
    let search =
        melops_decode::decoding::TransducerSearch::new(MockTransducer::streaming(2, 1), &config);
    let mut recognizer = Recognizer::new(config, search, Box::new(symbols())).unwrap();
    let mut stream = recognizer.create_stream();

    stream.accept_features(frames(&[0; 8]).view()).unwrap();
    drain(&mut recognizer, &mut stream);

    assert!(stream.endpoint().is_endpoint());
    assert!(!recognizer.is_endpoint(&stream));
}

#[test]
fn whisper_encodes_each_utterance_once() {
    let model = MockWhisper::new(16, Some(5));
    let (encodes, rows, steps) = (
        model.encodes.clone(),
        model.encoded_rows.clone(),
        model.steps.clone(),
    );
    let mut recognizer = whisper_recognizer(model);

    let result = recognize(&mut recognizer, &[2, 1]);

    assert_eq!(result.token_ids.len(), 5);
    assert_eq!(steps.load(Ordering::SeqCst), 6);
    assert_eq!(encodes.load(Ordering::SeqCst), 1);
    assert_eq!(rows.load(Ordering::SeqCst), 1);
}

#[test]
fn whisper_batch_encodes_once_for_all_streams() {
    let model = MockWhisper::new(16, Some(4));
    let (encodes, rows, steps) = (
        model.encodes.clone(),
        model.encoded_rows.clone(),
        model.steps.clone(),
    );
    let mut recognizer = whisper_recognizer(model);

    let mut streams: Vec<_> = [[1, 0], [2, 2], [3, 1]]
        .iter()
        .map(|ids| {
            let mut stream = recognizer.create_stream();
            stream.accept_features(frames(ids).view()).unwrap();
            stream.input_finished();
            stream
        })
        .collect();

    assert_eq!(recognizer.decode_ready(&mut streams).unwrap(), 3);
    assert!(streams.iter().all(|s| s.state().is_finished()));
    assert!(!streams.iter().any(|s| recognizer.is_ready(s)));

    assert_eq!(steps.load(Ordering::SeqCst), 3 * 5);
    assert_eq!(encodes.load(Ordering::SeqCst), 1);
    assert_eq!(rows.load(Ordering::SeqCst), 3);
}

#[test]
fn whisper_cache_offset_tracks_fed_tokens() {
    let mut decoder = WhisperDecoder::new(MockWhisper::new(4, None));
    let fresh = decoder.new_state();
    let mut state = decoder.encode(&[frames(&[1, 2])], &[&fresh]).unwrap().remove(0);

    for fed in 1..=4 {
        decoder.step(&mut state).unwrap();
        assert_eq!(state.offset(), fed);
        assert_eq!(state.self_cache().valid_len(), fed);
    }

    let err = decoder.step(&mut state).unwrap_err();

    assert!(matches!(
        err,
        Error::Precondition(PreconditionError::ContextOverflow {
            offset: 4,
            requested: 1,
            capacity: 4
        })
    ));
    assert_eq!(state.offset(), 4);
    assert_eq!(state.generated().len(), 4);
}

#[test]
fn whisper_step_requires_encoding() {
    let mut decoder = WhisperDecoder::new(MockWhisper::new(4, None));
    let mut state = decoder.new_state();

    let err = decoder.step(&mut state).unwrap_err();

    assert!(matches!(err, Error::Precondition(PreconditionError::NotEncoded)));
    assert_eq!(state.offset(), 0);
}

#[test]
fn whisper_stops_at_eot_or_full_context() {
    let mut bounded = whisper_recognizer(MockWhisper::new(4, None));
    let full = recognize(&mut bounded, &[1]);
    assert_eq!(full.token_ids.len(), 4);
    assert!(full.timestamps.is_empty());
    assert!(full.is_final);

    let mut finishing = whisper_recognizer(MockWhisper::new(8, Some(2)));
    let mut stream = finishing.create_stream();
    stream.accept_features(frames(&[1]).view()).unwrap();
    stream.input_finished();
    finishing.decode_one(&mut stream).unwrap();

    assert_eq!(finishing.result(&stream).token_ids, vec![3, 1]);
    assert!(stream.state().is_finished());
    assert_eq!(stream.state().offset(), 3);
}

#[test]
fn ctc_collapses_repeats_and_blanks() {
    let mut recognizer = ctc_recognizer(MockCtc::offline());

    let result = recognize(&mut recognizer, &[1, 1, 0, 2, 2, 2, 0, 1]);

    assert_eq!(result.token_ids, vec![1, 2, 1]);
    assert_eq!(result.text, "a b a");
    assert!((result.timestamps[2] - 0.7).abs() < 1e-5);
}

#[test]
fn ctc_collapse_spans_window_boundaries() {
    let mut recognizer = ctc_recognizer(MockCtc::streaming(3, 2));

    let result = recognize(&mut recognizer, &[1, 1, 1, 0, 1]);

    assert_eq!(result.token_ids, vec![1, 1]);
    assert!((result.timestamps[1] - 0.4).abs() < 1e-5);
}

#[test]
fn token_aligned_output_keeps_repeats() {
    let mut model = MockCtc::offline();
    model.alignment = melops_decode::models::OutputAlignment::Token;
    let mut recognizer = ctc_recognizer(model);

    let result = recognize(&mut recognizer, &[1, 1, 0, 2]);

    assert_eq!(result.token_ids, vec![1, 1, 2]);
    assert!(result.timestamps.is_empty());
}

#[test]
fn frames_are_decoded_exactly_once() {
    let mut recognizer =
        transducer_recognizer(MockTransducer::streaming(3, 2), DecodingMethod::GreedySearch);
    let mut stream = recognizer.create_stream();

    stream.accept_features(frames(&[1, 2, 3]).view()).unwrap();
    drain(&mut recognizer, &mut stream);
    stream.accept_features(frames(&[1, 2]).view()).unwrap();
    drain(&mut recognizer, &mut stream);
    stream.accept_features(frames(&[3]).view()).unwrap();
    stream.input_finished();
    drain(&mut recognizer, &mut stream);

    let result = recognizer.result(&stream);
    let frames: Vec<usize> = result
        .timestamps
        .iter()
        .map(|t| (t / FRAME_SHIFT).round() as usize)
        .collect();

    assert_eq!(result.token_ids, vec![1, 2, 3, 1, 2, 3]);
    assert_eq!(frames, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(stream.state().frames_decoded(), 6);
    assert!(result.is_final);
}

#[test]
fn foreign_stream_is_rejected() {
    let owner = ctc_recognizer(MockCtc::offline());
    let mut other = ctc_recognizer(MockCtc::offline());
    let mut stream = owner.create_stream();
    stream.accept_features(frames(&[1]).view()).unwrap();
    stream.input_finished();

    assert!(!other.is_ready(&stream));
    let err = other.decode_one(&mut stream).unwrap_err();

    assert!(matches!(
        err,
        Error::Precondition(PreconditionError::ForeignStream { .. })
    ));
    assert!(matches!(
        other.reset(&mut stream),
        Err(Error::Precondition(PreconditionError::ForeignStream { .. }))
    ));
}

#[test]
fn unready_stream_fails_whole_batch() {
    let mut recognizer = ctc_recognizer(MockCtc::offline());
    let mut ready = recognizer.create_stream();
    ready.accept_features(frames(&[1, 2]).view()).unwrap();
    ready.input_finished();
    let mut waiting = recognizer.create_stream();
    waiting.accept_features(frames(&[1]).view()).unwrap();

    let err = recognizer
        .decode_batch(&mut [&mut ready, &mut waiting])
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Precondition(PreconditionError::NotReady { .. })
    ));
    assert_eq!(ready.num_pending_frames(), 2);
    assert!(recognizer.is_ready(&ready));
}

#[test]
fn input_checks_are_caller_errors() {
    let recognizer = ctc_recognizer(MockCtc::offline());
    let mut stream = recognizer.create_stream();

    assert!(matches!(
        stream.accept_waveform(8000, &[0.0; 160]),
        Err(Error::Precondition(PreconditionError::SampleRateMismatch {
            expected: 16000,
            got: 8000
        }))
    ));
    assert!(matches!(
        stream.accept_features(ndarray::Array2::zeros((2, 3)).view()),
        Err(Error::Precondition(PreconditionError::FeatureDimMismatch {
            expected: 1,
            got: 3
        }))
    ));

    stream.input_finished();
    stream.input_finished();
    assert!(matches!(
        stream.accept_features(frames(&[1]).view()),
        Err(Error::Precondition(PreconditionError::InputAfterFinished { .. }))
    ));
}

#[test]
fn backend_error_leaves_stream_unchanged() {
    let model = MockCtc::streaming(3, 2);
    let fail = model.fail.clone();
    let mut recognizer = ctc_recognizer(model);
    let mut stream = recognizer.create_stream();
    stream.accept_features(frames(&[1, 1, 2, 2, 0, 3]).view()).unwrap();
    recognizer.decode_one(&mut stream).unwrap();

    let before = recognizer.result(&stream);
    let pending = stream.num_pending_frames();

    fail.store(true, Ordering::SeqCst);
    let err = recognizer.decode_one(&mut stream).unwrap_err();

    assert!(matches!(err, Error::Backend(BackendError::External(_))));
    assert_eq!(recognizer.result(&stream), before);
    assert_eq!(stream.num_pending_frames(), pending);
    assert!(recognizer.is_ready(&stream));

    fail.store(false, Ordering::SeqCst);
    stream.input_finished();
    drain(&mut recognizer, &mut stream);

    assert_eq!(recognizer.result(&stream).token_ids, vec![1, 2, 3]);
}

#[test]
fn transducer_backend_error_keeps_hypotheses() {
    let model = MockTransducer::streaming(2, 1);
    let fail = model.fail.clone();
    let mut recognizer = transducer_recognizer(model, DecodingMethod::ModifiedBeamSearch);
    let mut stream = recognizer.create_stream();
    stream.accept_features(frames(&[1, 2, 3]).view()).unwrap();
    recognizer.decode_one(&mut stream).unwrap();
    let hyps = stream.state().hypotheses().len();

    fail.store(true, Ordering::SeqCst);
    assert!(recognizer.decode_one(&mut stream).is_err());

    assert_eq!(stream.state().hypotheses().len(), hyps);
    assert_eq!(stream.state().frames_decoded(), 1);
    assert_eq!(recognizer.result(&stream).token_ids, vec![1]);
    assert_eq!(
        stream.state().encoder_state(),
        &MockEncoderState {
            windows: 1,
            frames: 1
        }
    );

    fail.store(false, Ordering::SeqCst);
    recognizer.decode_one(&mut stream).unwrap();

    assert_eq!(stream.state().encoder_state().windows, 2);
}

#[test]
fn encoder_state_carries_across_windows() {
    let mut recognizer =
        transducer_recognizer(MockTransducer::streaming(3, 2), DecodingMethod::GreedySearch);
    let mut stream = recognizer.create_stream();
    stream.accept_features(frames(&[1, 1, 0, 2, 2, 3, 0]).view()).unwrap();

    assert_eq!(stream.state().encoder_state(), &MockEncoderState::default());

    recognizer.decode_one(&mut stream).unwrap();
    recognizer.decode_one(&mut stream).unwrap();
    assert_eq!(
        stream.state().encoder_state(),
        &MockEncoderState {
            windows: 2,
            frames: 4
        }
    );

    stream.input_finished();
    drain(&mut recognizer, &mut stream);

    // 7 frames at a shift of 2 take 4 windows
    let state = stream.state();
    assert_eq!(state.encoder_state().windows, 4);
    assert_eq!(state.encoder_state().frames, state.frames_decoded());
    assert_eq!(recognizer.result(&stream).text, "a bc");
}

#[test]
fn encoder_state_matches_between_batch_and_single() {
    let method = DecodingMethod::ModifiedBeamSearch;
    let mut single = transducer_recognizer(MockTransducer::streaming(3, 2), method);
    let mut batched = transducer_recognizer(MockTransducer::streaming(3, 2), method);

    let expected: Vec<MockEncoderState> = UTTERANCES
        .iter()
        .map(|ids| {
            let mut stream = single.create_stream();
            stream.accept_features(frames(ids).view()).unwrap();
            stream.input_finished();
            drain(&mut single, &mut stream);
            stream.state().encoder_state().clone()
        })
        .collect();

    let mut streams: Vec<_> = UTTERANCES
        .iter()
        .map(|ids| {
            let mut stream = batched.create_stream();
            stream.accept_features(frames(ids).view()).unwrap();
            stream.input_finished();
            stream
        })
        .collect();
    while batched.decode_ready(&mut streams).unwrap() > 0 {}

    let got: Vec<MockEncoderState> = streams
        .iter()
        .map(|stream| stream.state().encoder_state().clone())
        .collect();
    assert_eq!(got, expected);
    assert_eq!(
        got.iter().map(|state| state.windows).collect::<Vec<_>>(),
        vec![3, 2, 5]
    );
}

#[test]
#[ignore = "requires NeMo CTC model files in MELOPS_NEMO_CTC_DIR"]
fn nemo_ctc_model_transcribes_silence() -> eyre::Result<()> {
    use melops_decode::pipelines::NemoCtcRecognizer;
    use melops_decode::{ModelRepo, RecognizerConfig};
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let dir = std::env::var("MELOPS_NEMO_CTC_DIR")?;
    let mut config = RecognizerConfig::default();
    config.model_config.nemo_ctc = Some("model.onnx".into());
    config.model_config.tokens = "tokens.txt".into();

    let mut recognizer = NemoCtcRecognizer::from_repo(&ModelRepo::Path(dir.into()), config)?;
    let mut stream = recognizer.create_stream();
    stream.accept_waveform(16000, &[0.0; 16000])?;
    stream.input_finished();

    while recognizer.is_ready(&stream) {
        recognizer.decode_one(&mut stream)?;
    }

    let result = recognizer.result(&stream);
    assert!(result.is_final);
    assert!(result.text.trim().is_empty());
    Ok(())
}
