//! Deterministic engine for tests.
//!
//! A soundfont is just its bytes read as a name. Rendering echoes the name and
//! the input so each output can be traced back to the call that produced it:
//! `compute("song")` with soundfont `sf` yields `RIFF:sf:song`.
//!
//! Magic inputs: an SMF of `bad` is a domain error, `panic` panics, an empty
//! soundfont fails to load, and MML containing `!` has a compile error.

use tokio_util::bytes::Bytes;

use crate::engine::{
    Engine, EngineError, FileInfo, MmlError, MmlOutput, Preset, SoundfontInfo,
};

#[derive(Debug, Default)]
pub struct FakeEngine;

impl Engine for FakeEngine {
    type Soundfont = String;

    fn load_soundfont(&mut self, sf2: Bytes) -> Result<String, EngineError> {
        if sf2.is_empty() {
            return Err(EngineError::domain(-2, "empty soundfont"));
        }
        Ok(String::from_utf8_lossy(&sf2).into_owned())
    }

    fn info(&self, soundfont: &String) -> Result<SoundfontInfo, EngineError> {
        Ok(SoundfontInfo {
            file_info: FileInfo {
                ifil: "2.1".to_string(),
                isng: "EMU8000".to_string(),
                inam: Some(soundfont.clone()),
                ..FileInfo::default()
            },
            presets: vec![Preset {
                bank: 0,
                no: 0,
                name: "Acoustic Grand Piano".to_string(),
            }],
        })
    }

    fn render(&mut self, soundfont: &String, smf: Bytes) -> Result<Bytes, EngineError> {
        match &smf[..] {
            b"bad" => Err(EngineError::domain(-1, "invalid SMF data")),
            b"panic" => panic!("renderer crashed"),
            input => {
                let mut wav = format!("RIFF:{soundfont}:").into_bytes();
                wav.extend_from_slice(input);
                Ok(Bytes::from(wav))
            }
        }
    }

    fn mml_to_smf(&mut self, mml: &str) -> Result<MmlOutput, EngineError> {
        if let Some(pos) = mml.find('!') {
            return Ok(MmlOutput::Errors(vec![MmlError {
                code: 3,
                line: 1,
                column: pos as u32 + 1,
                message: "unexpected character '!'".to_string(),
            }]));
        }
        Ok(MmlOutput::Smf(Bytes::from(format!("MThd:{mml}"))))
    }

    fn smf_to_mml(&mut self, smf: Bytes) -> Result<String, EngineError> {
        smf.strip_prefix(b"MThd:")
            .map(|mml| String::from_utf8_lossy(mml).into_owned())
            .ok_or_else(|| EngineError::domain(-3, "not a standard MIDI file"))
    }
}

pub fn fake_factory() -> impl Fn() -> Result<FakeEngine, EngineError> + Send + 'static {
    || Ok::<_, EngineError>(FakeEngine)
}

pub fn failing_factory() -> impl Fn() -> Result<FakeEngine, EngineError> + Send + 'static {
    || Err(EngineError::instantiate("corrupt program image"))
}
