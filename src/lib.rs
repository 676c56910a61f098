//! A no_std blocking driver for DFPlayer Mini MP3 modules
//!
//! This crate speaks the DFPlayer Mini binary serial protocol over any
//! embedded-io compatible serial port. It handles frame encoding and
//! checksum validation, reply correlation with timeout and retry,
//! unsolicited notification handling, and keeps a local shadow of the
//! module's playback state so advertisement interruptions can be resumed
//! correctly.
//!
//! ## Features
//!
//! - Full playback control: play, pause, stop, next/previous, random,
//!   folder and MP3-folder addressing, loop modes
//! - Advertisement playback with automatic resume of the interrupted track
//! - Volume as a 0-100 percentage with a configurable soft ceiling
//! - Query support (status, volume, EQ, track counts, firmware version)
//! - Optional low-latency mode that skips acknowledgement waits
//! - no_std compatible, host-testable
//!
//! ## Example
//!
//! ```rust,ignore
//! use dfplayer_mini::{Config, DfPlayer, Equalizer, TimeSource};
//!
//! // `port` is any embedded_io::Read + Write + ReadReady serial handle,
//! // configured for 9600 baud 8N1. `clock` implements TimeSource and
//! // `delay` implements embedded_hal::delay::DelayNs.
//! let mut player = DfPlayer::try_new(port, Config::default(), clock, delay)?;
//!
//! player.set_volume(40)?;
//! player.set_equalizer(Equalizer::Rock)?;
//! player.play_from_folder(2, 3)?;
//!
//! // Duck playback with an advertisement; the track resumes afterwards.
//! player.play_advert(1)?;
//! while player.poll_notification()?.is_none() {}
//! ```
//!
//! This crate optionally supports logging via the defmt framework.
//! Enable the "defmt" feature to activate logging.

#![cfg_attr(not(test), no_std)]

use embedded_hal::delay::DelayNs;
use embedded_io::{Read, ReadReady, Write};

#[cfg(feature = "defmt")]
use defmt::{info, warn};

// Protocol constants
const START_BYTE: u8 = 0x7E;
const END_BYTE: u8 = 0xEF;
const VERSION: u8 = 0xFF;
const MSG_LEN: u8 = 0x06;
const FRAME_LEN: usize = 10;

// Frame byte indices
const INDEX_VERSION: usize = 1;
const INDEX_LENGTH: usize = 2;
const INDEX_CMD: usize = 3;
const INDEX_FEEDBACK: usize = 4;
const INDEX_PARAM_H: usize = 5;
const INDEX_PARAM_L: usize = 6;
const INDEX_CHECKSUM_H: usize = 7;
const INDEX_CHECKSUM_L: usize = 8;

/// Maximum volume value in device units.
pub const MAX_VOLUME: u8 = 30;

/// Sleep between polls of the serial port while waiting for a reply.
const POLL_INTERVAL_MS: u32 = 10;

/// Minimal time provider trait for timeout tracking. Implement this for your platform.
pub trait TimeSource {
    /// Monotonic time point type
    type Instant: Copy + Clone + PartialEq + PartialOrd;

    /// Get the current time
    fn now(&self) -> Self::Instant;

    /// Check if a timeout has occurred
    fn is_elapsed(&self, since: Self::Instant, timeout_ms: u64) -> bool;
}

/// Media bitmask used by the insert/remove notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Source {
    /// Internal USB flash storage
    UsbFlash = 0b001,
    /// SD card inserted in the module
    SdCard = 0b010,
    /// External USB device connected to the module
    UsbHost = 0b100,
}

impl TryFrom<u8> for Source {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0b001 => Ok(Source::UsbFlash),
            0b010 => Ok(Source::SdCard),
            0b100 => Ok(Source::UsbHost),
            _ => Err(()),
        }
    }
}

/// Error codes reported by the DFPlayer module itself (command 0x40)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModuleError {
    /// Module is currently busy
    Busy = 1,
    /// Module is in sleep mode
    Sleeping = 2,
    /// Serial receive error occurred
    SerialRxError = 3,
    /// Checksum validation failed on our frame
    Checksum = 4,
    /// Requested track is out of valid range
    TrackNotInScope = 5,
    /// Track was not found on the media
    TrackNotFound = 6,
    /// Error inserting file/track
    InsertionError = 7,
    /// Module entering sleep mode
    EnterSleep = 8,
}

impl TryFrom<u8> for ModuleError {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ModuleError::Busy),
            2 => Ok(ModuleError::Sleeping),
            3 => Ok(ModuleError::SerialRxError),
            4 => Ok(ModuleError::Checksum),
            5 => Ok(ModuleError::TrackNotInScope),
            6 => Ok(ModuleError::TrackNotFound),
            7 => Ok(ModuleError::InsertionError),
            8 => Ok(ModuleError::EnterSleep),
            _ => Err(()),
        }
    }
}

/// Errors that can occur when operating the DFPlayer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<SerialError> {
    /// Serial port communication error
    SerialPort(SerialError),
    /// No valid reply arrived within the retry budget
    Timeout,
    /// Error reported by the module itself
    Module(ModuleError),
    /// Caller-supplied value outside the device-legal range
    InvalidParameter,
    /// Operation not valid in the current playback state
    InvalidState,
    /// A reply arrived but its payload could not be interpreted
    BrokenMessage,
}

/// Reasons a byte sequence failed to parse as a frame.
///
/// These never surface through the driver API; a bad frame is discarded
/// and the reader resynchronizes on the next start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FramingError {
    /// Stream ended before a full frame was available
    Truncated,
    /// Start/end marker or header byte mismatch
    BadMarker,
    /// Checksum field does not match the covered bytes
    BadChecksum,
    /// Well-formed frame carrying an opcode this driver does not know
    UnknownCommand,
}

/// Commands understood by the DFPlayer module
#[repr(u8)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Play next file
    Next = 0x01,
    /// Play previous file
    Previous = 0x02,
    /// Play a track by global index (1-2999)
    PlayTrack = 0x03,
    /// Increase volume by one step
    VolumeUp = 0x04,
    /// Decrease volume by one step
    VolumeDown = 0x05,
    /// Set volume in device units, 0-30
    SetVolume = 0x06,
    /// Select equalizer preset
    SetEq = 0x07,
    /// Select the playback source (USB/SD/...)
    SetPlaybackSource = 0x09,
    /// Enter sleep/standby mode
    EnterSleep = 0x0A,
    /// Wake from standby
    EnterNormal = 0x0B,
    /// Reset the device
    Reset = 0x0C,
    /// Resume playback
    Play = 0x0D,
    /// Pause current playback
    Pause = 0x0E,
    /// Play a track inside a folder, 99 folders of 255 tracks each max
    PlayTrackInFolder = 0x0F,
    /// Loop over all tracks on the media
    PlayLoopAll = 0x11,
    /// Play a track from the MP3 folder
    PlayTrackInMp3Folder = 0x12,
    /// Play a track from the ADVERT folder, interrupting playback
    StartAdvertisement = 0x13,
    /// Stop an active ADVERT track
    StopAdvertisement = 0x15,
    /// Stop all playback including advertisements
    Stop = 0x16,
    /// Loop all tracks inside a folder
    PlayLoopFolder = 0x17,
    /// Play random tracks from the current source
    PlayRandom = 0x18,
    /// Loop the currently playing track
    LoopCurrentTrack = 0x19,
    /// Sent by the module when media is connected
    NotifyPushMedia = 0x3A,
    /// Sent by the module when media is removed
    NotifyPullOutMedia = 0x3B,
    /// Sent by the module when a track on USB flash finished
    NotifyFinishTrackUsb = 0x3C,
    /// Sent by the module when a track on the SD card finished
    NotifyFinishTrackSd = 0x3D,
    /// Sent by the module when a track on the USB host link finished
    NotifyFinishTrackUsbHost = 0x3E,
    /// Sent by the module when an error occurs
    NotifyError = 0x40,
    /// Sent as ACK when feedback was requested
    NotifyReply = 0x41,
    /// Returns module status
    QueryStatus = 0x42,
    /// Returns current volume setting
    QueryVolume = 0x43,
    /// Returns current EQ setting
    QueryEq = 0x44,
    /// Returns current playback source/mode
    QueryPlaybackMode = 0x45,
    /// Returns firmware version
    QueryVersion = 0x46,
    /// Returns number of tracks on USB storage
    QueryTrackCountUsb = 0x47,
    /// Returns number of tracks on the SD card
    QueryTrackCountSd = 0x48,
    /// Returns number of tracks on flash
    QueryTrackCountFlash = 0x49,
    /// Returns current track number on the SD card
    QueryCurrentTrackSd = 0x4C,
    /// Returns number of tracks in a folder
    QueryFolderTrackCount = 0x4E,
    /// Returns number of folders on the media
    QueryFolderCount = 0x4F,
}

impl Command {
    /// Whether this opcode is only ever sent unsolicited by the module.
    pub fn is_notification(self) -> bool {
        matches!(
            self,
            Command::NotifyPushMedia
                | Command::NotifyPullOutMedia
                | Command::NotifyFinishTrackUsb
                | Command::NotifyFinishTrackSd
                | Command::NotifyFinishTrackUsbHost
        )
    }
}

impl TryFrom<u8> for Command {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Next),
            0x02 => Ok(Command::Previous),
            0x03 => Ok(Command::PlayTrack),
            0x04 => Ok(Command::VolumeUp),
            0x05 => Ok(Command::VolumeDown),
            0x06 => Ok(Command::SetVolume),
            0x07 => Ok(Command::SetEq),
            0x09 => Ok(Command::SetPlaybackSource),
            0x0A => Ok(Command::EnterSleep),
            0x0B => Ok(Command::EnterNormal),
            0x0C => Ok(Command::Reset),
            0x0D => Ok(Command::Play),
            0x0E => Ok(Command::Pause),
            0x0F => Ok(Command::PlayTrackInFolder),
            0x11 => Ok(Command::PlayLoopAll),
            0x12 => Ok(Command::PlayTrackInMp3Folder),
            0x13 => Ok(Command::StartAdvertisement),
            0x15 => Ok(Command::StopAdvertisement),
            0x16 => Ok(Command::Stop),
            0x17 => Ok(Command::PlayLoopFolder),
            0x18 => Ok(Command::PlayRandom),
            0x19 => Ok(Command::LoopCurrentTrack),
            0x3A => Ok(Command::NotifyPushMedia),
            0x3B => Ok(Command::NotifyPullOutMedia),
            0x3C => Ok(Command::NotifyFinishTrackUsb),
            0x3D => Ok(Command::NotifyFinishTrackSd),
            0x3E => Ok(Command::NotifyFinishTrackUsbHost),
            0x40 => Ok(Command::NotifyError),
            0x41 => Ok(Command::NotifyReply),
            0x42 => Ok(Command::QueryStatus),
            0x43 => Ok(Command::QueryVolume),
            0x44 => Ok(Command::QueryEq),
            0x45 => Ok(Command::QueryPlaybackMode),
            0x46 => Ok(Command::QueryVersion),
            0x47 => Ok(Command::QueryTrackCountUsb),
            0x48 => Ok(Command::QueryTrackCountSd),
            0x49 => Ok(Command::QueryTrackCountFlash),
            0x4C => Ok(Command::QueryCurrentTrackSd),
            0x4E => Ok(Command::QueryFolderTrackCount),
            0x4F => Ok(Command::QueryFolderCount),
            _ => Err(()),
        }
    }
}

/// Equalizer presets available on the DFPlayer
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Equalizer {
    /// Normal (flat) equalizer setting
    Normal = 0x0,
    /// Pop music preset
    Pop = 0x1,
    /// Rock music preset
    Rock = 0x2,
    /// Jazz music preset
    Jazz = 0x3,
    /// Classical music preset
    Classic = 0x4,
    /// Bass boost preset
    Bass = 0x5,
}

impl TryFrom<u8> for Equalizer {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Equalizer::Normal),
            0x1 => Ok(Equalizer::Pop),
            0x2 => Ok(Equalizer::Rock),
            0x3 => Ok(Equalizer::Jazz),
            0x4 => Ok(Equalizer::Classic),
            0x5 => Ok(Equalizer::Bass),
            _ => Err(()),
        }
    }
}

/// Media sources selectable with [`Command::SetPlaybackSource`]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PlaybackSource {
    /// USB storage device
    UsbDisk = 0x1,
    /// SD card
    SdCard = 0x2,
    /// Auxiliary input
    Aux = 0x3,
    /// Sleep mode (no source)
    Sleep = 0x4,
    /// Flash memory
    Flash = 0x5,
}

/// Coarse playback mode mirrored from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PlayerMode {
    /// Nothing is playing
    #[default]
    Stopped,
    /// A track is playing
    Playing,
    /// Playback is paused
    Paused,
}

/// Active repeat setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoopMode {
    /// No repeat
    #[default]
    None,
    /// Repeat the current track
    Track,
    /// Repeat all tracks in one folder
    Folder,
    /// Repeat the entire library
    All,
}

/// Unsolicited events pushed by the module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Notification {
    /// A media device was inserted
    MediaInserted(Source),
    /// A media device was removed
    MediaRemoved(Source),
    /// The given track finished playing
    TrackFinished(u16),
    /// An advertisement finished; the interrupted track was resumed
    AdvertFinished(u16),
}

/// Local shadow of the module's playback state.
///
/// The real state lives on the device; this copy is updated only from
/// commands that resolved successfully and from device notifications, and
/// may diverge until a status query reconciles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PlaybackState {
    /// Playing, paused or stopped
    pub mode: PlayerMode,
    /// Active repeat setting
    pub loop_mode: LoopMode,
    /// Folder of the current track, when it was addressed by folder
    pub current_folder: Option<u8>,
    /// Current track number, when known
    pub current_track: Option<u16>,
    /// Volume in device units (0-30)
    pub volume: u8,
    /// Whether an advertisement is interrupting playback
    pub advert_active: bool,
}

/// Playback context saved while an advertisement interrupts it.
///
/// The protocol supports a single level of interruption, so this is one
/// slot rather than a stack.
#[derive(Debug, Clone, Copy)]
struct AdvertSnapshot {
    folder: Option<u8>,
    track: Option<u16>,
    mode: PlayerMode,
}

/// What a sent frame expects back from the module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// Fire-and-forget, return right after the write
    None,
    /// Wait for the 0x41 acknowledgement
    Ack,
    /// Wait for a reply frame carrying the given opcode
    Reply(Command),
}

/// Driver configuration, all fields overridable at construction
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Request per-command acknowledgements. Disabling this is the
    /// low-latency mode: commands return right after the write and
    /// delivery is not confirmed.
    pub feedback: bool,
    /// How long to wait for a reply before retrying, in milliseconds
    pub timeout_ms: u64,
    /// How many times to resend an unanswered frame
    pub max_retries: u8,
    /// Soft volume ceiling in device units. Values mapping above it are
    /// clamped, not rejected.
    pub volume_ceiling: u8,
    /// Volume applied during initialization, as a percentage
    pub initial_volume_percent: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feedback: true,
            timeout_ms: 500,
            max_retries: 2,
            volume_ceiling: MAX_VOLUME / 2,
            initial_volume_percent: 50,
        }
    }
}

/// Calculate the checksum for a DFPlayer frame
///
/// The checksum is the two's complement of the sum of the bytes from the
/// version field through the low parameter byte.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for &b in bytes {
        sum = sum.wrapping_add(u16::from(b));
    }
    0u16.wrapping_sub(sum)
}

/// One protocol frame: an opcode and its 16-bit parameter
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    /// Operation code
    pub command: Command,
    /// Command-specific 16-bit parameter
    pub param: u16,
}

impl Frame {
    /// Create a frame from an opcode and its parameter
    pub const fn new(command: Command, param: u16) -> Self {
        Self { command, param }
    }

    /// Encode this frame into its 10-byte wire representation.
    ///
    /// `ack` sets the feedback flag asking the module to acknowledge the
    /// command with a 0x41 reply. Encoding never fails; every opcode and
    /// 16-bit parameter is representable.
    pub fn encode(&self, ack: bool) -> [u8; FRAME_LEN] {
        let mut bytes =
            [START_BYTE, VERSION, MSG_LEN, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, END_BYTE];
        bytes[INDEX_CMD] = self.command as u8;
        bytes[INDEX_FEEDBACK] = ack as u8;
        bytes[INDEX_PARAM_H] = (self.param >> 8) as u8;
        bytes[INDEX_PARAM_L] = self.param as u8;
        let sum = checksum(&bytes[INDEX_VERSION..INDEX_CHECKSUM_H]);
        bytes[INDEX_CHECKSUM_H] = (sum >> 8) as u8;
        bytes[INDEX_CHECKSUM_L] = sum as u8;
        bytes
    }

    /// Decode a 10-byte wire frame, verifying markers and checksum.
    ///
    /// A frame failing any check is rejected whole; callers discard it and
    /// resynchronize on the next start marker.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < FRAME_LEN {
            return Err(FramingError::Truncated);
        }
        let bytes = &bytes[..FRAME_LEN];
        if bytes[0] != START_BYTE
            || bytes[FRAME_LEN - 1] != END_BYTE
            || bytes[INDEX_VERSION] != VERSION
            || bytes[INDEX_LENGTH] != MSG_LEN
        {
            return Err(FramingError::BadMarker);
        }
        let received = u16::from(bytes[INDEX_CHECKSUM_H]) << 8
            | u16::from(bytes[INDEX_CHECKSUM_L]);
        if received != checksum(&bytes[INDEX_VERSION..INDEX_CHECKSUM_H]) {
            return Err(FramingError::BadChecksum);
        }
        let command = Command::try_from(bytes[INDEX_CMD])
            .map_err(|()| FramingError::UnknownCommand)?;
        let param =
            u16::from(bytes[INDEX_PARAM_H]) << 8 | u16::from(bytes[INDEX_PARAM_L]);
        Ok(Self { command, param })
    }
}

/// Map a 0-100 volume percentage to device units (0-30).
///
/// Input above 100 is clamped. Rounds so that the device-to-percent
/// conversion round-trips exactly.
pub fn volume_from_percent(percent: u8) -> u8 {
    let pct = u16::from(percent.min(100));
    ((pct * u16::from(MAX_VOLUME) + 50) / 100) as u8
}

/// Map device volume units (0-30) back to a 0-100 percentage.
pub fn volume_to_percent(raw: u8) -> u8 {
    let raw = u16::from(raw.min(MAX_VOLUME));
    ((raw * 100 + u16::from(MAX_VOLUME) / 2) / u16::from(MAX_VOLUME)) as u8
}

// Range checks for folder/track addressing. The device's behavior for
// illegal numbers is undefined, so these fail instead of clamping.

fn check_folder<E>(folder: u8) -> Result<(), Error<E>> {
    if folder == 0 || folder > 99 {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}

fn check_folder_track<E>(track: u8) -> Result<(), Error<E>> {
    if track == 0 {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}

fn check_track<E>(track: u16) -> Result<(), Error<E>> {
    if track == 0 || track > 2999 {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}

// ADVERT and MP3 folders use 4-digit file names, a wider range than
// regular folders.
fn check_wide_track<E>(track: u16) -> Result<(), Error<E>> {
    if track == 0 || track > 9999 {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}

/// Main driver for interfacing with DFPlayer Mini modules
pub struct DfPlayer<S, T, D>
where
    S: Read + Write + ReadReady,
    T: TimeSource,
    D: DelayNs,
{
    port: S,
    config: Config,
    time_source: T,
    delay: D,
    state: PlaybackState,
    advert_snapshot: Option<AdvertSnapshot>,
    resume_pending: Option<AdvertSnapshot>,
}

impl<S, T, D> DfPlayer<S, T, D>
where
    S: Read + Write + ReadReady,
    T: TimeSource,
    D: DelayNs,
{
    /// Create a new DFPlayer interface
    ///
    /// The serial port must be configured for 9600 baud, 8N1 before
    /// calling this.
    ///
    /// Initialization drains any stale data from the receive buffer, then
    /// selects the SD card as the media source and applies
    /// [`Config::initial_volume_percent`]. These commands are sent without
    /// waiting for acknowledgement so that a module that is still booting
    /// does not fail construction; modules frequently drop replies during
    /// startup.
    ///
    /// # Arguments
    /// * `port` - Serial port connected to the DFPlayer module
    /// * `config` - Timeout, retry, feedback and volume-ceiling settings
    /// * `time_source` - Source of time for timeout tracking
    /// * `delay` - Delay provider for pacing delays
    pub fn try_new(
        port: S,
        config: Config,
        time_source: T,
        delay: D,
    ) -> Result<Self, Error<S::Error>> {
        let mut player = Self {
            port,
            config,
            time_source,
            delay,
            state: PlaybackState::default(),
            advert_snapshot: None,
            resume_pending: None,
        };

        player.clear_receive_buffer()?;

        // Source selection needs settling time before the module will
        // accept further commands.
        player.transact(
            Frame::new(
                Command::SetPlaybackSource,
                u16::from(PlaybackSource::SdCard as u8),
            ),
            Expect::None,
        )?;
        player.delay.delay_ms(200);

        let initial = volume_from_percent(player.config.initial_volume_percent)
            .min(player.config.volume_ceiling);
        player.transact(
            Frame::new(Command::SetVolume, u16::from(initial)),
            Expect::None,
        )?;
        player.delay.delay_ms(100);
        player.state.volume = initial;

        #[cfg(feature = "defmt")]
        info!("DFPlayer initialization complete");

        Ok(player)
    }

    /// Read-only view of the local playback state shadow
    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// Consume the driver, returning the serial port
    pub fn release(self) -> S {
        self.port
    }

    // --- request/response correlation -----------------------------------

    /// Send a frame and resolve it according to `expect`.
    ///
    /// On timeout the identical frame is resent up to
    /// [`Config::max_retries`] times. Resending is safe: the module only
    /// acts on the most recent command and queries have no side effects.
    fn transact(
        &mut self,
        frame: Frame,
        expect: Expect,
    ) -> Result<Frame, Error<S::Error>> {
        // Only request an acknowledgement when one will be drained.
        // Fire-and-forget frames must not leave stale acks in the receive
        // buffer to be mistaken for the answer to a later command.
        let bytes = frame.encode(self.config.feedback && expect != Expect::None);
        let mut attempt: u8 = 0;
        loop {
            #[cfg(feature = "defmt")]
            info!("tx {}", bytes);

            self.port.write_all(&bytes).map_err(Error::SerialPort)?;
            if expect == Expect::None {
                return Ok(frame);
            }
            match self.await_reply(expect) {
                Ok(reply) => return Ok(reply),
                Err(Error::Timeout) if attempt < self.config.max_retries => {
                    attempt += 1;
                    #[cfg(feature = "defmt")]
                    warn!("no reply for {}, retry {}", frame.command, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read frames until the one matching `expect` arrives.
    ///
    /// Notifications received while waiting are dispatched to the state
    /// machine immediately; unrelated solicited frames (stale replies from
    /// an earlier exchange) are discarded.
    fn await_reply(&mut self, expect: Expect) -> Result<Frame, Error<S::Error>> {
        let started = self.time_source.now();
        loop {
            let frame = self.read_frame(started)?;
            if frame.command.is_notification() {
                let _ = self.dispatch_notification(frame);
                continue;
            }
            if frame.command == Command::NotifyError {
                match ModuleError::try_from(frame.param as u8) {
                    Ok(err) => return Err(Error::Module(err)),
                    Err(()) => continue,
                }
            }
            match expect {
                Expect::Ack if frame.command == Command::NotifyReply => {
                    return Ok(frame)
                }
                Expect::Reply(command) if frame.command == command => {
                    return Ok(frame)
                }
                _ => continue,
            }
        }
    }

    /// Assemble one valid frame from the byte stream, or time out.
    ///
    /// Bytes are read one at a time; the parser hunts for the start
    /// marker, collects the fixed-length remainder and validates it.
    /// Invalid frames are dropped and parsing restarts at the next start
    /// marker.
    fn read_frame(
        &mut self,
        started: T::Instant,
    ) -> Result<Frame, Error<S::Error>> {
        let mut buf = [0u8; FRAME_LEN];
        let mut index = 0usize;
        loop {
            if self
                .time_source
                .is_elapsed(started, self.config.timeout_ms)
            {
                return Err(Error::Timeout);
            }
            if !self.port.read_ready().map_err(Error::SerialPort)? {
                self.delay.delay_ms(POLL_INTERVAL_MS);
                continue;
            }
            let mut byte = [0u8; 1];
            if self.port.read(&mut byte).map_err(Error::SerialPort)? == 0 {
                continue;
            }
            if index == 0 && byte[0] != START_BYTE {
                continue;
            }
            buf[index] = byte[0];
            index += 1;
            if index == FRAME_LEN {
                index = 0;
                match Frame::decode(&buf) {
                    Ok(frame) => {
                        #[cfg(feature = "defmt")]
                        info!("rx {} param {}", frame.command, frame.param);
                        return Ok(frame);
                    }
                    Err(_e) => {
                        #[cfg(feature = "defmt")]
                        warn!("discarding bad frame: {}", _e);
                    }
                }
            }
        }
    }

    /// Read and discard any stale bytes waiting in the receive buffer
    fn clear_receive_buffer(&mut self) -> Result<(), Error<S::Error>> {
        let mut scratch = [0u8; 16];
        while self.port.read_ready().map_err(Error::SerialPort)? {
            if self.port.read(&mut scratch).map_err(Error::SerialPort)? == 0 {
                break;
            }
        }
        Ok(())
    }

    // --- notification handling ------------------------------------------

    /// Update the state shadow from one unsolicited frame.
    ///
    /// A track-finished event while an advertisement is active means the
    /// advert ended; the saved context is queued for resume. The resume
    /// command itself is sent by `service_resume` once no request is in
    /// flight.
    fn dispatch_notification(&mut self, frame: Frame) -> Option<Notification> {
        match frame.command {
            Command::NotifyPushMedia => Source::try_from(frame.param as u8)
                .ok()
                .map(Notification::MediaInserted),
            Command::NotifyPullOutMedia => Source::try_from(frame.param as u8)
                .ok()
                .map(Notification::MediaRemoved),
            Command::NotifyFinishTrackUsb
            | Command::NotifyFinishTrackSd
            | Command::NotifyFinishTrackUsbHost => {
                if self.state.advert_active {
                    self.state.advert_active = false;
                    self.resume_pending = self.advert_snapshot.take();
                    #[cfg(feature = "defmt")]
                    info!("advert {} finished, resume queued", frame.param);
                    Some(Notification::AdvertFinished(frame.param))
                } else {
                    // The notification carries a global track number, so any
                    // earlier folder addressing no longer applies.
                    self.state.current_folder = None;
                    self.state.current_track = Some(frame.param);
                    Some(Notification::TrackFinished(frame.param))
                }
            }
            _ => None,
        }
    }

    /// Reissue the play command for a context saved before an advert.
    ///
    /// The module switched playback source for the advert, so restoring
    /// local state is not enough; it must be told to return.
    fn service_resume(&mut self) -> Result<(), Error<S::Error>> {
        let Some(snap) = self.resume_pending.take() else {
            return Ok(());
        };
        let frame = match (snap.folder, snap.track) {
            (Some(folder), Some(track)) => Frame::new(
                Command::PlayTrackInFolder,
                u16::from(folder) << 8 | (track & 0x00FF),
            ),
            (None, Some(track)) => Frame::new(Command::PlayTrack, track),
            _ => Frame::new(Command::Play, 0),
        };
        if let Err(e) = self.transact(frame, self.control_expect()) {
            // Keep the context; the next call retries the resume.
            self.resume_pending = Some(snap);
            return Err(e);
        }
        self.state.mode = snap.mode;
        self.state.current_folder = snap.folder;
        self.state.current_track = snap.track;
        Ok(())
    }

    /// Drain one pending unsolicited frame while no command is in flight.
    ///
    /// Call this periodically when idle so track-finished and media events
    /// are not lost between commands. Also completes a pending
    /// advertisement resume. Returns immediately when no data is waiting.
    pub fn poll_notification(
        &mut self,
    ) -> Result<Option<Notification>, Error<S::Error>> {
        self.service_resume()?;
        if !self.port.read_ready().map_err(Error::SerialPort)? {
            return Ok(None);
        }
        let started = self.time_source.now();
        let frame = match self.read_frame(started) {
            Ok(frame) => frame,
            // Partial or corrupted data only; it was discarded.
            Err(Error::Timeout) => return Ok(None),
            Err(e) => return Err(e),
        };
        let note = if frame.command.is_notification() {
            self.dispatch_notification(frame)
        } else {
            None
        };
        self.service_resume()?;
        Ok(note)
    }

    fn control_expect(&self) -> Expect {
        if self.config.feedback {
            Expect::Ack
        } else {
            Expect::None
        }
    }

    /// Send a control command, honoring the feedback setting
    fn command(
        &mut self,
        command: Command,
        param: u16,
    ) -> Result<(), Error<S::Error>> {
        self.service_resume()?;
        self.transact(Frame::new(command, param), self.control_expect())?;
        Ok(())
    }

    /// Send a query and return the reply parameter
    fn query(
        &mut self,
        command: Command,
        param: u16,
    ) -> Result<u16, Error<S::Error>> {
        self.service_resume()?;
        let reply =
            self.transact(Frame::new(command, param), Expect::Reply(command))?;
        Ok(reply.param)
    }

    // --- playback control -----------------------------------------------

    /// Resume playback of the current context
    pub fn play(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::Play, 0)?;
        self.state.mode = PlayerMode::Playing;
        Ok(())
    }

    /// Play a track by its global index (1-2999)
    pub fn play_track(&mut self, track: u16) -> Result<(), Error<S::Error>> {
        check_track(track)?;
        self.command(Command::PlayTrack, track)?;
        self.state.mode = PlayerMode::Playing;
        self.state.current_folder = None;
        self.state.current_track = Some(track);
        Ok(())
    }

    /// Play a track from a numbered folder.
    ///
    /// Folders are named `01`-`99` on the media, tracks `0001`-`0255`
    /// inside them.
    pub fn play_from_folder(
        &mut self,
        folder: u8,
        track: u8,
    ) -> Result<(), Error<S::Error>> {
        check_folder(folder)?;
        check_folder_track(track)?;
        self.command(
            Command::PlayTrackInFolder,
            u16::from(folder) << 8 | u16::from(track),
        )?;
        self.state.mode = PlayerMode::Playing;
        self.state.current_folder = Some(folder);
        self.state.current_track = Some(u16::from(track));
        Ok(())
    }

    /// Play a track from the MP3 folder (1-9999)
    pub fn play_mp3(&mut self, track: u16) -> Result<(), Error<S::Error>> {
        check_wide_track(track)?;
        self.command(Command::PlayTrackInMp3Folder, track)?;
        self.state.mode = PlayerMode::Playing;
        self.state.current_folder = None;
        self.state.current_track = Some(track);
        Ok(())
    }

    /// Play the next track.
    ///
    /// The current track number is refreshed from the module's
    /// track-finished notification rather than guessed here.
    pub fn next(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::Next, 0)?;
        self.state.mode = PlayerMode::Playing;
        Ok(())
    }

    /// Play the previous track
    pub fn previous(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::Previous, 0)?;
        self.state.mode = PlayerMode::Playing;
        Ok(())
    }

    /// Play tracks from the current source in random order
    pub fn play_random(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::PlayRandom, 0)?;
        self.state.mode = PlayerMode::Playing;
        Ok(())
    }

    /// Pause the current playback
    pub fn pause(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::Pause, 0)?;
        self.state.mode = PlayerMode::Paused;
        Ok(())
    }

    /// Stop all playback, including an active advertisement.
    ///
    /// Clears the loop mode and any saved advert context; there is nothing
    /// left to resume after a full stop.
    pub fn stop(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::Stop, 0)?;
        self.state.mode = PlayerMode::Stopped;
        self.state.loop_mode = LoopMode::None;
        self.state.advert_active = false;
        self.advert_snapshot = None;
        self.resume_pending = None;
        Ok(())
    }

    // --- loop modes -----------------------------------------------------

    /// Enable or disable looping of the current track.
    ///
    /// Loop modes are mutually exclusive; enabling this clears any folder
    /// or library loop.
    pub fn loop_track(&mut self, enable: bool) -> Result<(), Error<S::Error>> {
        // Inverted on the wire: 0 enables, 1 disables.
        self.command(Command::LoopCurrentTrack, if enable { 0 } else { 1 })?;
        self.state.loop_mode = if enable { LoopMode::Track } else { LoopMode::None };
        Ok(())
    }

    /// Loop all tracks inside the given folder (1-99)
    pub fn loop_folder(&mut self, folder: u8) -> Result<(), Error<S::Error>> {
        check_folder(folder)?;
        self.command(Command::PlayLoopFolder, u16::from(folder))?;
        self.state.loop_mode = LoopMode::Folder;
        self.state.mode = PlayerMode::Playing;
        self.state.current_folder = Some(folder);
        Ok(())
    }

    /// Enable or disable looping over the entire library
    pub fn loop_all(&mut self, enable: bool) -> Result<(), Error<S::Error>> {
        self.command(Command::PlayLoopAll, u16::from(enable))?;
        if enable {
            self.state.loop_mode = LoopMode::All;
            self.state.mode = PlayerMode::Playing;
        } else {
            self.state.loop_mode = LoopMode::None;
        }
        Ok(())
    }

    // --- advertisements -------------------------------------------------

    /// Interrupt the current track with a clip from the ADVERT folder
    /// (track 1-9999).
    ///
    /// Requires that a track is currently playing; interrupting silence or
    /// a paused track is rejected with [`Error::InvalidState`], as is a
    /// second advert while one is active. The interrupted context is saved
    /// and resumed when the advert finishes or [`Self::stop_advert`] is
    /// called.
    pub fn play_advert(&mut self, track: u16) -> Result<(), Error<S::Error>> {
        if self.state.mode != PlayerMode::Playing || self.state.advert_active {
            return Err(Error::InvalidState);
        }
        check_wide_track(track)?;
        self.command(Command::StartAdvertisement, track)?;
        self.advert_snapshot = Some(AdvertSnapshot {
            folder: self.state.current_folder,
            track: self.state.current_track,
            mode: self.state.mode,
        });
        self.state.advert_active = true;
        Ok(())
    }

    /// Abort an active advertisement and resume the interrupted track.
    ///
    /// A no-op returning success when no advert is active; stopping
    /// nothing twice is a reasonable contract.
    pub fn stop_advert(&mut self) -> Result<(), Error<S::Error>> {
        if !self.state.advert_active {
            return Ok(());
        }
        self.command(Command::StopAdvertisement, 0)?;
        self.state.advert_active = false;
        self.resume_pending = self.advert_snapshot.take();
        self.service_resume()
    }

    // --- volume and EQ --------------------------------------------------

    /// Set the volume as a percentage (0-100).
    ///
    /// Out-of-range input is clamped to 100, and the mapped device value
    /// is clamped to [`Config::volume_ceiling`]. Raise the ceiling at
    /// construction to use the full device range.
    pub fn set_volume(&mut self, percent: u8) -> Result<(), Error<S::Error>> {
        let raw = volume_from_percent(percent).min(self.config.volume_ceiling);
        self.command(Command::SetVolume, u16::from(raw))?;
        self.state.volume = raw;
        Ok(())
    }

    /// Raise the volume by one device step, respecting the soft ceiling
    pub fn volume_up(&mut self) -> Result<(), Error<S::Error>> {
        if self.state.volume >= self.config.volume_ceiling {
            return Ok(());
        }
        self.command(Command::VolumeUp, 0)?;
        self.state.volume = (self.state.volume + 1).min(MAX_VOLUME);
        Ok(())
    }

    /// Lower the volume by one device step
    pub fn volume_down(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::VolumeDown, 0)?;
        self.state.volume = self.state.volume.saturating_sub(1);
        Ok(())
    }

    /// Set the equalizer preset
    pub fn set_equalizer(
        &mut self,
        equalizer: Equalizer,
    ) -> Result<(), Error<S::Error>> {
        self.command(Command::SetEq, u16::from(equalizer as u8))
    }

    // --- media and power ------------------------------------------------

    /// Select the media source for playback.
    ///
    /// Includes a settling delay; the module re-scans the file system
    /// after switching sources.
    pub fn set_playback_source(
        &mut self,
        source: PlaybackSource,
    ) -> Result<(), Error<S::Error>> {
        let result =
            self.command(Command::SetPlaybackSource, u16::from(source as u8));
        self.delay.delay_ms(200);
        result
    }

    /// Enter low-power sleep mode.
    ///
    /// While asleep the module answers most commands with
    /// [`ModuleError::Sleeping`].
    pub fn sleep(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::EnterSleep, 0)
    }

    /// Wake from sleep mode
    pub fn wake(&mut self) -> Result<(), Error<S::Error>> {
        self.command(Command::EnterNormal, 0)
    }

    /// Reset the module and wait for it to restart.
    ///
    /// The module rarely acknowledges a reset, so none is awaited. Local
    /// state is cleared; the device comes back with its defaults.
    ///
    /// # Arguments
    /// * `reset_duration_override` - Optional override for the restart
    ///   delay in milliseconds (default 1500, typical M16P boot time)
    pub fn reset(
        &mut self,
        reset_duration_override: Option<u32>,
    ) -> Result<(), Error<S::Error>> {
        self.transact(Frame::new(Command::Reset, 0), Expect::None)?;
        self.delay
            .delay_ms(reset_duration_override.unwrap_or(1500));
        self.clear_receive_buffer()?;
        self.state = PlaybackState::default();
        self.advert_snapshot = None;
        self.resume_pending = None;
        Ok(())
    }

    // --- queries --------------------------------------------------------

    /// Query the current volume, as a percentage.
    ///
    /// Also refreshes the state shadow with the device value.
    pub fn volume(&mut self) -> Result<u8, Error<S::Error>> {
        let raw = (self.query(Command::QueryVolume, 0)? & 0xFF) as u8;
        self.state.volume = raw.min(MAX_VOLUME);
        Ok(volume_to_percent(raw))
    }

    /// Query the current equalizer preset
    pub fn equalizer(&mut self) -> Result<Equalizer, Error<S::Error>> {
        let raw = (self.query(Command::QueryEq, 0)? & 0xFF) as u8;
        Equalizer::try_from(raw).map_err(|()| Error::BrokenMessage)
    }

    /// Query whether the module is playing, paused or stopped.
    ///
    /// Reconciles the local mode shadow with the device's answer.
    pub fn status(&mut self) -> Result<PlayerMode, Error<S::Error>> {
        let reply = self.query(Command::QueryStatus, 0)?;
        let mode = match reply & 0xFF {
            0x00 => PlayerMode::Stopped,
            0x01 => PlayerMode::Playing,
            0x02 => PlayerMode::Paused,
            _ => return Err(Error::BrokenMessage),
        };
        self.state.mode = mode;
        Ok(mode)
    }

    /// Query the current playback source/mode word, raw
    pub fn playback_mode(&mut self) -> Result<u16, Error<S::Error>> {
        self.query(Command::QueryPlaybackMode, 0)
    }

    /// Query the firmware version
    pub fn firmware_version(&mut self) -> Result<u16, Error<S::Error>> {
        self.query(Command::QueryVersion, 0)
    }

    /// Query the number of the track currently playing from the SD card
    pub fn current_track(&mut self) -> Result<u16, Error<S::Error>> {
        let track = self.query(Command::QueryCurrentTrackSd, 0)?;
        self.state.current_track = Some(track);
        Ok(track)
    }

    /// Query the total number of tracks on a media source.
    ///
    /// Only storage sources can be counted; `Aux` and `Sleep` are
    /// rejected.
    pub fn track_count(
        &mut self,
        source: PlaybackSource,
    ) -> Result<u16, Error<S::Error>> {
        let command = match source {
            PlaybackSource::UsbDisk => Command::QueryTrackCountUsb,
            PlaybackSource::SdCard => Command::QueryTrackCountSd,
            PlaybackSource::Flash => Command::QueryTrackCountFlash,
            _ => return Err(Error::InvalidParameter),
        };
        self.query(command, 0)
    }

    /// Query the number of tracks inside a folder (1-99)
    pub fn folder_track_count(
        &mut self,
        folder: u8,
    ) -> Result<u16, Error<S::Error>> {
        check_folder(folder)?;
        self.query(Command::QueryFolderTrackCount, u16::from(folder))
    }

    /// Query the number of folders on the media
    pub fn folder_count(&mut self) -> Result<u16, Error<S::Error>> {
        self.query(Command::QueryFolderCount, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use core::convert::Infallible;
    use std::collections::VecDeque;
    use std::vec::Vec;

    /// Scripted serial port. Reads come from a queue the test fills,
    /// writes are captured for inspection.
    #[derive(Default)]
    struct MockPort {
        inner: RefCell<MockInner>,
    }

    #[derive(Default)]
    struct MockInner {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl MockPort {
        fn new() -> Self {
            Self::default()
        }

        fn push_rx(&self, bytes: &[u8]) {
            self.inner.borrow_mut().rx.extend(bytes.iter().copied());
        }

        fn take_tx(&self) -> Vec<u8> {
            core::mem::take(&mut self.inner.borrow_mut().tx)
        }
    }

    impl embedded_io::ErrorType for &MockPort {
        type Error = Infallible;
    }

    impl Read for &MockPort {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let mut inner = self.inner.borrow_mut();
            let mut count = 0;
            while count < buf.len() {
                match inner.rx.pop_front() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }
    }

    impl Write for &MockPort {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.inner.borrow_mut().tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    impl ReadReady for &MockPort {
        fn read_ready(&mut self) -> Result<bool, Self::Error> {
            Ok(!self.inner.borrow().rx.is_empty())
        }
    }

    /// Clock that advances one millisecond per elapsed-check, standing in
    /// for real waiting.
    struct TestClock {
        now: Cell<u64>,
    }

    impl TestClock {
        fn new() -> Self {
            Self { now: Cell::new(0) }
        }
    }

    impl TimeSource for TestClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            self.now.get()
        }

        fn is_elapsed(&self, since: u64, timeout_ms: u64) -> bool {
            self.now.set(self.now.get() + 1);
            self.now.get().saturating_sub(since) >= timeout_ms
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    type TestPlayer<'a> = DfPlayer<&'a MockPort, TestClock, NoDelay>;

    fn player(port: &MockPort, config: Config) -> TestPlayer<'_> {
        let player =
            DfPlayer::try_new(port, config, TestClock::new(), NoDelay).unwrap();
        // discard the initialization frames
        port.take_tx();
        player
    }

    fn low_latency() -> Config {
        Config {
            feedback: false,
            ..Config::default()
        }
    }

    fn reply(command: Command, param: u16) -> [u8; 10] {
        Frame::new(command, param).encode(false)
    }

    fn ack() -> [u8; 10] {
        reply(Command::NotifyReply, 0)
    }

    fn sent_frames(bytes: &[u8]) -> Vec<Frame> {
        assert_eq!(bytes.len() % 10, 0, "partial frame in tx capture");
        bytes.chunks(10).map(|c| Frame::decode(c).unwrap()).collect()
    }

    // --- codec ----------------------------------------------------------

    #[test]
    fn encode_matches_known_vector() {
        // "play track 1" as documented in the DFPlayer Mini manual
        let bytes = Frame::new(Command::PlayTrack, 1).encode(false);
        assert_eq!(
            bytes,
            [0x7E, 0xFF, 0x06, 0x03, 0x00, 0x00, 0x01, 0xFE, 0xF7, 0xEF]
        );
    }

    #[test]
    fn encode_feedback_flag_changes_checksum() {
        let bytes = Frame::new(Command::PlayTrack, 1).encode(true);
        assert_eq!(bytes[INDEX_FEEDBACK], 0x01);
        assert_eq!(
            bytes,
            [0x7E, 0xFF, 0x06, 0x03, 0x01, 0x00, 0x01, 0xFE, 0xF6, 0xEF]
        );
    }

    #[test]
    fn checksum_known_value() {
        assert_eq!(checksum(&[0xFF, 0x06, 0x03, 0x00, 0x00, 0x01]), 0xFEF7);
    }

    #[test]
    fn decode_round_trips_encode() {
        let cases = [
            (Command::PlayTrack, 1),
            (Command::SetVolume, 30),
            (Command::StartAdvertisement, 9999),
            (Command::PlayTrackInFolder, 0x0203),
            (Command::QueryStatus, 0x0201),
            (Command::NotifyFinishTrackSd, 7),
        ];
        for (command, param) in cases {
            let frame = Frame::new(command, param);
            for ack in [false, true] {
                assert_eq!(Frame::decode(&frame.encode(ack)), Ok(frame));
            }
        }
    }

    #[test]
    fn decode_rejects_any_single_byte_corruption() {
        let good = Frame::new(Command::PlayTrackInFolder, 0x0203).encode(false);
        assert!(Frame::decode(&good).is_ok());
        for i in 0..good.len() {
            let mut bad = good;
            bad[i] = bad[i].wrapping_add(1);
            assert!(
                Frame::decode(&bad).is_err(),
                "corruption at byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let good = Frame::new(Command::QueryVolume, 0).encode(false);
        assert_eq!(Frame::decode(&good[..9]), Err(FramingError::Truncated));
        assert_eq!(Frame::decode(&[]), Err(FramingError::Truncated));
    }

    #[test]
    fn decode_reports_bad_checksum() {
        let mut bad = Frame::new(Command::QueryVolume, 0).encode(false);
        bad[INDEX_PARAM_L] ^= 0x10;
        assert_eq!(Frame::decode(&bad), Err(FramingError::BadChecksum));
    }

    // --- volume mapping -------------------------------------------------

    #[test]
    fn volume_mapping_is_monotonic() {
        let mut last = 0;
        for percent in 0..=100u8 {
            let raw = volume_from_percent(percent);
            assert!(raw >= last);
            assert!(raw <= MAX_VOLUME);
            last = raw;
        }
    }

    #[test]
    fn volume_mapping_round_trips_device_range() {
        for raw in 0..=MAX_VOLUME {
            assert_eq!(volume_from_percent(volume_to_percent(raw)), raw);
        }
    }

    #[test]
    fn volume_mapping_clamps_out_of_range_input() {
        assert_eq!(volume_from_percent(255), MAX_VOLUME);
        assert_eq!(volume_to_percent(255), 100);
    }

    #[test]
    fn set_volume_above_100_clamps_to_ceiling() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.set_volume(150).unwrap();
        let frames = sent_frames(&port.take_tx());
        // default ceiling is half the device max, so 15 and not 30
        assert_eq!(frames, [Frame::new(Command::SetVolume, 15)]);
        assert_eq!(player.state().volume, 15);
    }

    #[test]
    fn volume_up_stops_at_ceiling() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.set_volume(100).unwrap();
        port.take_tx();
        player.volume_up().unwrap();
        assert!(port.take_tx().is_empty());
        assert_eq!(player.state().volume, 15);
        player.volume_down().unwrap();
        assert_eq!(sent_frames(&port.take_tx()).len(), 1);
        assert_eq!(player.state().volume, 14);
    }

    // --- parameter validation -------------------------------------------

    #[test]
    fn out_of_range_addressing_fails_without_io() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        assert_eq!(player.play_from_folder(0, 1), Err(Error::InvalidParameter));
        assert_eq!(player.play_from_folder(100, 1), Err(Error::InvalidParameter));
        assert_eq!(player.play_from_folder(1, 0), Err(Error::InvalidParameter));
        assert_eq!(player.play_track(0), Err(Error::InvalidParameter));
        assert_eq!(player.play_track(3000), Err(Error::InvalidParameter));
        assert_eq!(player.play_mp3(10000), Err(Error::InvalidParameter));
        assert_eq!(player.loop_folder(0), Err(Error::InvalidParameter));
        assert_eq!(player.folder_track_count(0), Err(Error::InvalidParameter));
        assert_eq!(
            player.track_count(PlaybackSource::Aux),
            Err(Error::InvalidParameter)
        );
        assert!(port.take_tx().is_empty());
    }

    // --- construction ---------------------------------------------------

    #[test]
    fn init_selects_sd_and_applies_initial_volume() {
        let port = MockPort::new();
        let player =
            DfPlayer::try_new(&port, Config::default(), TestClock::new(), NoDelay)
                .unwrap();
        let frames = sent_frames(&port.take_tx());
        assert_eq!(
            frames,
            [
                Frame::new(Command::SetPlaybackSource, 2),
                // 50% of 30 is 15, at the default ceiling
                Frame::new(Command::SetVolume, 15),
            ]
        );
        assert_eq!(player.state().volume, 15);
    }

    #[test]
    fn init_frames_do_not_request_acknowledgement() {
        let port = MockPort::new();
        let mut player =
            DfPlayer::try_new(&port, Config::default(), TestClock::new(), NoDelay)
                .unwrap();
        // feedback is enabled, but nothing waits on the init commands, so
        // they must not ask the module for acks
        let tx = port.take_tx();
        assert_eq!(tx.len(), 20);
        for frame in tx.chunks(10) {
            assert_eq!(frame[INDEX_FEEDBACK], 0x00);
        }
        // with no stale acks buffered, a silent device is a timeout, not a
        // phantom delivery confirmation
        assert_eq!(player.pause(), Err(Error::Timeout));
    }

    // --- correlation, retry, resync -------------------------------------

    #[test]
    fn fire_and_forget_returns_after_write() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.next().unwrap();
        assert_eq!(sent_frames(&port.take_tx()), [Frame::new(Command::Next, 0)]);
        assert_eq!(player.state().mode, PlayerMode::Playing);
    }

    #[test]
    fn silent_device_causes_exactly_three_sends() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        assert_eq!(player.pause(), Err(Error::Timeout));
        let tx = port.take_tx();
        assert_eq!(tx.len(), 30);
        assert_eq!(tx[..10], tx[10..20]);
        assert_eq!(tx[..10], tx[20..30]);
    }

    #[test]
    fn query_waits_past_ack_for_reply() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        port.push_rx(&ack());
        port.push_rx(&reply(Command::QueryVolume, 15));
        assert_eq!(player.volume(), Ok(50));
        assert_eq!(player.state().volume, 15);
    }

    #[test]
    fn reader_skips_garbage_and_stale_frames() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        // line noise without a start marker, an unrelated notification,
        // then the answer
        port.push_rx(&[0x13, 0x00, 0xAB]);
        port.push_rx(&reply(Command::NotifyFinishTrackSd, 9));
        port.push_rx(&reply(Command::QueryStatus, 0x0201));
        assert_eq!(player.status(), Ok(PlayerMode::Playing));
        assert_eq!(player.state().mode, PlayerMode::Playing);
        assert_eq!(player.state().current_track, Some(9));
    }

    #[test]
    fn reader_resynchronizes_after_corrupt_frame() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        let mut corrupt = reply(Command::QueryVersion, 0x0203);
        corrupt[INDEX_PARAM_L] ^= 0xFF;
        port.push_rx(&corrupt);
        port.push_rx(&reply(Command::QueryVersion, 0x0203));
        assert_eq!(player.firmware_version(), Ok(0x0203));
    }

    #[test]
    fn module_error_reply_surfaces_without_retry() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        port.push_rx(&reply(Command::NotifyError, 6));
        assert_eq!(player.play(), Err(Error::Module(ModuleError::TrackNotFound)));
        // one send, no retries for a definitive answer
        assert_eq!(port.take_tx().len(), 10);
    }

    #[test]
    fn broken_status_payload_is_rejected() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        port.push_rx(&reply(Command::QueryStatus, 0x0263));
        assert_eq!(player.status(), Err(Error::BrokenMessage));
    }

    #[test]
    fn equalizer_query_decodes_preset() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        port.push_rx(&reply(Command::QueryEq, 2));
        assert_eq!(player.equalizer(), Ok(Equalizer::Rock));
        port.push_rx(&reply(Command::QueryEq, 9));
        assert_eq!(player.equalizer(), Err(Error::BrokenMessage));
    }

    // --- loop modes -----------------------------------------------------

    #[test]
    fn loop_modes_are_mutually_exclusive() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.loop_folder(3).unwrap();
        assert_eq!(player.state().loop_mode, LoopMode::Folder);
        player.loop_all(true).unwrap();
        assert_eq!(player.state().loop_mode, LoopMode::All);
        player.loop_track(true).unwrap();
        assert_eq!(player.state().loop_mode, LoopMode::Track);
        player.stop().unwrap();
        assert_eq!(player.state().loop_mode, LoopMode::None);
        assert_eq!(player.state().mode, PlayerMode::Stopped);
    }

    #[test]
    fn loop_track_wire_polarity_is_inverted() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.loop_track(true).unwrap();
        player.loop_track(false).unwrap();
        let frames = sent_frames(&port.take_tx());
        assert_eq!(
            frames,
            [
                Frame::new(Command::LoopCurrentTrack, 0),
                Frame::new(Command::LoopCurrentTrack, 1),
            ]
        );
    }

    // --- advertisements -------------------------------------------------

    #[test]
    fn advert_requires_active_playback() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        assert_eq!(player.play_advert(1), Err(Error::InvalidState));
        assert!(port.take_tx().is_empty());

        port.push_rx(&reply(Command::QueryStatus, 0x0202));
        player.status().unwrap();
        port.take_tx();
        // paused is not playing either
        assert_eq!(player.play_advert(1), Err(Error::InvalidState));
        assert!(port.take_tx().is_empty());
    }

    #[test]
    fn nested_advert_is_rejected() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.play_from_folder(2, 3).unwrap();
        player.play_advert(1).unwrap();
        assert_eq!(player.play_advert(2), Err(Error::InvalidState));
    }

    #[test]
    fn advert_track_range_is_wider_than_folders() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.play_from_folder(2, 3).unwrap();
        assert_eq!(player.play_advert(0), Err(Error::InvalidParameter));
        assert_eq!(player.play_advert(10000), Err(Error::InvalidParameter));
        player.play_advert(9999).unwrap();
    }

    #[test]
    fn advert_finish_resumes_interrupted_track() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.play_from_folder(2, 3).unwrap();
        player.play_advert(1).unwrap();
        assert!(player.state().advert_active);

        port.push_rx(&reply(Command::NotifyFinishTrackSd, 1));
        assert_eq!(
            player.poll_notification(),
            Ok(Some(Notification::AdvertFinished(1)))
        );

        let frames = sent_frames(&port.take_tx());
        assert_eq!(
            frames,
            [
                Frame::new(Command::PlayTrackInFolder, 0x0203),
                Frame::new(Command::StartAdvertisement, 1),
                // exactly one resume command, for the saved context
                Frame::new(Command::PlayTrackInFolder, 0x0203),
            ]
        );
        let state = player.state();
        assert_eq!(state.mode, PlayerMode::Playing);
        assert_eq!(state.current_folder, Some(2));
        assert_eq!(state.current_track, Some(3));
        assert!(!state.advert_active);
    }

    #[test]
    fn advert_finish_during_wait_is_dispatched_then_resumed() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        port.push_rx(&ack());
        player.play_from_folder(2, 3).unwrap();
        port.push_rx(&ack());
        player.play_advert(1).unwrap();
        port.take_tx();

        // the advert ends while we are waiting for the pause ack
        port.push_rx(&reply(Command::NotifyFinishTrackSd, 1));
        port.push_rx(&ack());
        player.pause().unwrap();
        assert!(!player.state().advert_active);

        // resume is deferred until no request is in flight
        port.push_rx(&ack());
        assert_eq!(player.poll_notification(), Ok(None));
        let frames = sent_frames(&port.take_tx());
        assert_eq!(
            frames,
            [
                Frame::new(Command::Pause, 0),
                Frame::new(Command::PlayTrackInFolder, 0x0203),
            ]
        );
        assert_eq!(player.state().mode, PlayerMode::Playing);
    }

    #[test]
    fn failed_resume_is_retried_on_next_poll() {
        let port = MockPort::new();
        let mut player = player(&port, Config::default());
        port.push_rx(&ack());
        player.play_from_folder(2, 3).unwrap();
        port.push_rx(&ack());
        player.play_advert(1).unwrap();
        port.take_tx();

        // the advert ends but the device drops the resume command
        port.push_rx(&reply(Command::NotifyFinishTrackSd, 1));
        assert_eq!(player.poll_notification(), Err(Error::Timeout));
        port.take_tx();

        // the saved context survives the failure; the next poll resumes
        port.push_rx(&ack());
        assert_eq!(player.poll_notification(), Ok(None));
        let frames = sent_frames(&port.take_tx());
        assert_eq!(frames, [Frame::new(Command::PlayTrackInFolder, 0x0203)]);
        assert_eq!(player.state().mode, PlayerMode::Playing);
        assert_eq!(player.state().current_track, Some(3));
    }

    #[test]
    fn track_finished_clears_stale_folder_addressing() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.play_from_folder(2, 3).unwrap();
        port.push_rx(&reply(Command::NotifyFinishTrackSd, 12));
        assert_eq!(
            player.poll_notification(),
            Ok(Some(Notification::TrackFinished(12)))
        );
        assert_eq!(player.state().current_folder, None);

        // an advert saved after that point resumes by global track number,
        // never mixing the old folder with the new track
        player.play_advert(1).unwrap();
        port.take_tx();
        port.push_rx(&reply(Command::NotifyFinishTrackSd, 1));
        assert_eq!(
            player.poll_notification(),
            Ok(Some(Notification::AdvertFinished(1)))
        );
        let frames = sent_frames(&port.take_tx());
        assert_eq!(frames, [Frame::new(Command::PlayTrack, 12)]);
    }

    #[test]
    fn stop_advert_is_idempotent() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.play_from_folder(2, 3).unwrap();
        player.play_advert(5).unwrap();
        port.take_tx();

        player.stop_advert().unwrap();
        let frames = sent_frames(&port.take_tx());
        assert_eq!(
            frames,
            [
                Frame::new(Command::StopAdvertisement, 0),
                Frame::new(Command::PlayTrackInFolder, 0x0203),
            ]
        );
        assert_eq!(player.state().mode, PlayerMode::Playing);
        assert!(!player.state().advert_active);

        // second call has nothing to stop and writes nothing
        player.stop_advert().unwrap();
        assert!(port.take_tx().is_empty());
    }

    #[test]
    fn stop_discards_saved_advert_context() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.play_from_folder(2, 3).unwrap();
        player.play_advert(1).unwrap();
        player.stop().unwrap();
        port.take_tx();

        // no resume fires later; the context is gone
        assert_eq!(player.poll_notification(), Ok(None));
        assert!(port.take_tx().is_empty());
        assert!(!player.state().advert_active);
        assert_eq!(player.state().mode, PlayerMode::Stopped);
    }

    #[test]
    fn track_finished_updates_shadow_track() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        player.next().unwrap();
        port.push_rx(&reply(Command::NotifyFinishTrackSd, 12));
        assert_eq!(
            player.poll_notification(),
            Ok(Some(Notification::TrackFinished(12)))
        );
        assert_eq!(player.state().current_track, Some(12));
    }

    #[test]
    fn media_notifications_are_reported() {
        let port = MockPort::new();
        let mut player = player(&port, low_latency());
        port.push_rx(&reply(Command::NotifyPushMedia, 0b010));
        assert_eq!(
            player.poll_notification(),
            Ok(Some(Notification::MediaInserted(Source::SdCard)))
        );
        port.push_rx(&reply(Command::NotifyPullOutMedia, 0b010));
        assert_eq!(
            player.poll_notification(),
            Ok(Some(Notification::MediaRemoved(Source::SdCard)))
        );
        assert_eq!(player.poll_notification(), Ok(None));
    }
}
