//! Text-to-speech into an mp3 file

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use crate::audio::speech::speak_segmented;
use crate::cli::Backend;
use crate::core::config::data::path_display;

pub async fn run_speak(backend: &Backend, input: &Path, output: &Path) -> Result<(), Box<dyn Error>> {
    let text = tokio::fs::read_to_string(input)
        .await
        .map_err(|err| format!("Failed to read {}: {err}", path_display(input)))?;
    speak_to_file(backend, &text, output).await
}

pub(crate) async fn speak_to_file(
    backend: &Backend,
    text: &str,
    output: &Path,
) -> Result<(), Box<dyn Error>> {
    let synthesizer = Arc::new(backend.speech());
    let speech = speak_segmented(synthesizer, text, backend.config.max_speech_input).await?;
    let parts = speech.parts;
    let written = speech.write_to(output).await?;
    eprintln!(
        "🔊 Wrote {written} bytes of audio ({parts} part{}) to {}",
        if parts == 1 { "" } else { "s" },
        path_display(output)
    );
    Ok(())
}
