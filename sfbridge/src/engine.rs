//! Engine contract - the computation the worker hosts.
//!
//! Soundfont decoding, SMF rendering and MML compilation live outside this
//! crate. The worker only reaches them through [`Engine`], created lazily
//! (at most once per worker) through an [`EngineFactory`].

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// Soundfont descriptor returned by `info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundfontInfo {
    #[serde(rename = "FileInfo")]
    pub file_info: FileInfo,
    #[serde(rename = "Presets")]
    pub presets: Vec<Preset>,
}

/// Contents of the soundfont's RIFF `INFO` list.
///
/// `ifil` and `isng` are mandatory in SF2. The remaining chunks are optional
/// and serialize as `null` when the file omits them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub ifil: String,
    pub isng: String,
    #[serde(rename = "INAM")]
    pub inam: Option<String>,
    pub iver: Option<String>,
    #[serde(rename = "ICRD")]
    pub icrd: Option<String>,
    #[serde(rename = "IENG")]
    pub ieng: Option<String>,
    #[serde(rename = "IPRD")]
    pub iprd: Option<String>,
    #[serde(rename = "ICOP")]
    pub icop: Option<String>,
    #[serde(rename = "ICMT")]
    pub icmt: Option<String>,
    #[serde(rename = "ISFT")]
    pub isft: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub bank: u16,
    pub no: u16,
    pub name: String,
}

/// A single MML compile diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmlError {
    pub code: i32,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// Outcome of compiling MML. Compile errors are data, not failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmlOutput {
    Smf(Bytes),
    Errors(Vec<MmlError>),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Engine-reported failure with its numeric error code.
    #[error("{message} (code {code})")]
    Domain { code: i32, message: String },

    #[error("failed to instantiate engine: {0}")]
    Instantiate(String),

    #[error("operation not supported by engine: {0}")]
    Unsupported(&'static str),
}

impl EngineError {
    pub fn domain(code: i32, message: impl Into<String>) -> Self {
        Self::Domain {
            code,
            message: message.into(),
        }
    }

    pub fn instantiate(message: impl Into<String>) -> Self {
        Self::Instantiate(message.into())
    }
}

/// The computation engine, as seen from the worker host loop.
///
/// Implementations run on the worker's own thread and are never shared, so
/// neither `Send` nor `Sync` is required here.
pub trait Engine {
    /// Handle to a decoded soundfont.
    type Soundfont;

    fn load_soundfont(&mut self, sf2: Bytes) -> Result<Self::Soundfont, EngineError>;

    fn info(&self, soundfont: &Self::Soundfont) -> Result<SoundfontInfo, EngineError>;

    /// Render a Standard MIDI File to a WAV file.
    fn render(&mut self, soundfont: &Self::Soundfont, smf: Bytes) -> Result<Bytes, EngineError>;

    fn mml_to_smf(&mut self, _mml: &str) -> Result<MmlOutput, EngineError> {
        Err(EngineError::Unsupported("mml_to_smf"))
    }

    fn smf_to_mml(&mut self, _smf: Bytes) -> Result<String, EngineError> {
        Err(EngineError::Unsupported("smf_to_mml"))
    }
}

/// Program image for the engine: instantiates it inside the worker.
pub trait EngineFactory: Send + 'static {
    type Engine: Engine;

    fn instantiate(&self) -> Result<Self::Engine, EngineError>;
}

impl<F, E> EngineFactory for F
where
    F: Fn() -> Result<E, EngineError> + Send + 'static,
    E: Engine,
{
    type Engine = E;

    fn instantiate(&self) -> Result<E, EngineError> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    #[test]
    fn soundfont_info_serializes_missing_chunks_as_null() {
        let info = SoundfontInfo {
            file_info: FileInfo {
                ifil: "2.1".to_string(),
                isng: "EMU8000".to_string(),
                inam: Some("GeneralUser".to_string()),
                ..FileInfo::default()
            },
            presets: vec![Preset {
                bank: 0,
                no: 1,
                name: "Bright Piano".to_string(),
            }],
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "FileInfo": {
            "ifil": "2.1",
            "isng": "EMU8000",
            "INAM": "GeneralUser",
            "iver": null,
            "ICRD": null,
            "IENG": null,
            "IPRD": null,
            "ICOP": null,
            "ICMT": null,
            "ISFT": null
          },
          "Presets": [
            {
              "bank": 0,
              "no": 1,
              "name": "Bright Piano"
            }
          ]
        }
        "#);
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::domain(-1, "invalid SMF header");
        assert_eq!(err.to_string(), "invalid SMF header (code -1)");

        let err = EngineError::instantiate("bad program image");
        assert_eq!(
            err.to_string(),
            "failed to instantiate engine: bad program image"
        );

        let err = EngineError::Unsupported("smf_to_mml");
        assert_eq!(
            err.to_string(),
            "operation not supported by engine: smf_to_mml"
        );
    }

    #[test]
    fn closure_is_an_engine_factory() {
        let factory = || Ok::<_, EngineError>(FakeEngine);
        assert!(factory.instantiate().is_ok());

        let failing = || Err::<FakeEngine, _>(EngineError::instantiate("nope"));
        assert!(matches!(
            failing.instantiate(),
            Err(EngineError::Instantiate(_))
        ));
    }

    struct RenderOnly;

    impl Engine for RenderOnly {
        type Soundfont = ();

        fn load_soundfont(&mut self, _sf2: Bytes) -> Result<(), EngineError> {
            Ok(())
        }

        fn info(&self, _soundfont: &()) -> Result<SoundfontInfo, EngineError> {
            Ok(SoundfontInfo::default())
        }

        fn render(&mut self, _soundfont: &(), smf: Bytes) -> Result<Bytes, EngineError> {
            Ok(smf)
        }
    }

    #[test]
    fn mml_operations_default_to_unsupported() {
        let mut engine = RenderOnly;
        assert!(matches!(
            engine.mml_to_smf("cde"),
            Err(EngineError::Unsupported("mml_to_smf"))
        ));
        assert!(matches!(
            engine.smf_to_mml(Bytes::from_static(b"MThd")),
            Err(EngineError::Unsupported("smf_to_mml"))
        ));
    }
}
