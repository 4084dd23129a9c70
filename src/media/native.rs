#![cfg(feature = "native-decode")]

//! In-process decoding through the FFmpeg libraries (ffmpeg-next).

use std::path::Path;

use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as Scaler, Flags};
use ffmpeg_next::util::frame::Video as VideoFrame;
use image::RgbImage;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::error::{MediaError, MediaResult};

/// Frames buffered between the decode thread and the consumer.
const CHANNEL_DEPTH: usize = 4;

pub type SampledFrame = (u64, RgbImage);

/// Decode `video` on a blocking thread, sampling roughly `fps` frames per second.
///
/// Frames arrive in order, numbered by sample index. Dropping the receiver stops decoding.
pub fn spawn_sampled_decode(video: &Path, fps: u32) -> mpsc::Receiver<MediaResult<SampledFrame>> {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let path = video.to_path_buf();

    tokio::task::spawn_blocking(move || {
        if let Err(e) = decode_into(&path, fps, &tx) {
            let _ = tx.blocking_send(Err(e));
        }
    });

    rx
}

fn decode_into(
    path: &Path,
    fps: u32,
    tx: &mpsc::Sender<MediaResult<SampledFrame>>,
) -> MediaResult<()> {
    ffmpeg_next::init().map_err(native)?;

    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    let mut input = ffmpeg_next::format::input(path).map_err(native)?;
    let stream = input
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| MediaError::Native(format!("no video stream in {}", path.display())))?;
    let stream_index = stream.index();

    let rate = stream.avg_frame_rate();
    let source_fps = if rate.denominator() > 0 && rate.numerator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        warn!("Could not determine source FPS, assuming 25");
        25.0
    };
    let step = ((source_fps / fps.max(1) as f64).round() as u64).max(1);

    let context = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
        .map_err(native)?;
    let mut decoder = context.decoder().video().map_err(native)?;

    let (width, height) = (decoder.width(), decoder.height());
    let mut scaler = Scaler::get(
        decoder.format(),
        width,
        height,
        Pixel::RGB24,
        width,
        height,
        Flags::BILINEAR,
    )
    .map_err(native)?;

    info!(
        video = %path.display(),
        width,
        height,
        source_fps,
        step,
        "Native decoder opened"
    );

    let mut state = DecodeState {
        decoded: 0,
        sampled: 0,
        step,
    };

    let mut packet = ffmpeg_next::Packet::empty();
    loop {
        match packet.read(&mut input) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => break,
            Err(e) => return Err(native(e)),
        }
        if packet.stream() != stream_index {
            continue;
        }
        decoder.send_packet(&packet).map_err(native)?;
        if !drain(&mut decoder, &mut scaler, &mut state, tx)? {
            return Ok(());
        }
    }

    decoder.send_eof().map_err(native)?;
    drain(&mut decoder, &mut scaler, &mut state, tx)?;

    info!(
        frames_decoded = state.decoded,
        frames_sampled = state.sampled,
        "Native decode complete"
    );
    Ok(())
}

struct DecodeState {
    decoded: u64,
    sampled: u64,
    step: u64,
}

/// Pull every ready frame out of the decoder. Returns false once the consumer is gone.
fn drain(
    decoder: &mut ffmpeg_next::decoder::Video,
    scaler: &mut Scaler,
    state: &mut DecodeState,
    tx: &mpsc::Sender<MediaResult<SampledFrame>>,
) -> MediaResult<bool> {
    let mut decoded = VideoFrame::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        let index = state.decoded;
        state.decoded += 1;
        if index % state.step != 0 {
            continue;
        }

        let mut rgb = VideoFrame::empty();
        scaler.run(&decoded, &mut rgb).map_err(native)?;
        let image = to_rgb_image(&rgb)?;

        if tx.blocking_send(Ok((state.sampled, image))).is_err() {
            return Ok(false);
        }
        state.sampled += 1;
    }
    Ok(true)
}

/// Copy a packed RGB24 frame into an image buffer, dropping row padding.
fn to_rgb_image(frame: &VideoFrame) -> MediaResult<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + row_bytes]);
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| MediaError::Native("decoded frame buffer size mismatch".to_string()))
}

fn native(e: ffmpeg_next::Error) -> MediaError {
    MediaError::Native(e.to_string())
}
