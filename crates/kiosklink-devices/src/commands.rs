//! Static command and switch tables.
//!
//! The devices expose a fixed remote-control vocabulary. Switches are
//! paired on/off commands surfaced as one boolean point; plain commands are
//! one-shot buttons, text settings or numeric settings. Some switches also
//! announce their state changes as push-channel events, which is what makes
//! event-driven confirmation possible.

/// Declared value type of a plain command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Fire-and-forget button. A written `false` is disregarded.
    Button,
    Text,
    Number,
}

/// A plain (non-switch) command.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub kind: CommandKind,
}

/// A paired on/off command surfaced as one boolean switch point.
#[derive(Debug, Clone, Copy)]
pub struct SwitchPairDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub command_on: &'static str,
    pub command_off: &'static str,
    /// Push-channel event announcing the on transition, when the device
    /// emits one.
    pub event_on: Option<&'static str>,
    pub event_off: Option<&'static str>,
}

/// Switch table.
pub const SWITCHES: &[SwitchPairDescriptor] = &[
    SwitchPairDescriptor {
        id: "screenSwitch",
        name: "Turn screen on and off",
        command_on: "screenOn",
        command_off: "screenOff",
        event_on: Some("screenOn"),
        event_off: Some("screenOff"),
    },
    SwitchPairDescriptor {
        id: "screensaverSwitch",
        name: "Turn screensaver on and off",
        command_on: "startScreensaver",
        command_off: "stopScreensaver",
        event_on: Some("onScreensaverStart"),
        event_off: Some("onScreensaverStop"),
    },
    SwitchPairDescriptor {
        id: "daydreamSwitch",
        name: "Turn daydream on and off",
        command_on: "startDaydream",
        command_off: "stopDaydream",
        event_on: Some("onDaydreamStart"),
        event_off: Some("onDaydreamStop"),
    },
    SwitchPairDescriptor {
        id: "lockedModeSwitch",
        name: "Turn locked mode on and off",
        command_on: "enableLockedMode",
        command_off: "disableLockedMode",
        event_on: None,
        event_off: None,
    },
    SwitchPairDescriptor {
        id: "isInForeground",
        name: "Bring the app to foreground or background",
        command_on: "toForeground",
        command_off: "toBackground",
        event_on: Some("foreground"),
        event_off: Some("background"),
    },
];

/// Plain command table.
pub const COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor { id: "clearCache", name: "Clear cache", kind: CommandKind::Button },
    CommandDescriptor { id: "clearCookies", name: "Clear cookies", kind: CommandKind::Button },
    CommandDescriptor { id: "clearWebstorage", name: "Clear webstorage", kind: CommandKind::Button },
    CommandDescriptor { id: "disableLockedMode", name: "Disable locked mode", kind: CommandKind::Button },
    CommandDescriptor { id: "enableLockedMode", name: "Enable locked mode", kind: CommandKind::Button },
    CommandDescriptor { id: "exitApp", name: "Exit app", kind: CommandKind::Button },
    CommandDescriptor { id: "forceSleep", name: "Force sleep", kind: CommandKind::Button },
    CommandDescriptor { id: "loadStartURL", name: "Load start URL", kind: CommandKind::Button },
    CommandDescriptor { id: "popFragment", name: "Pop fragment", kind: CommandKind::Button },
    CommandDescriptor { id: "restartApp", name: "Restart app", kind: CommandKind::Button },
    CommandDescriptor { id: "screenOff", name: "Screen off", kind: CommandKind::Button },
    CommandDescriptor { id: "screenOn", name: "Screen on", kind: CommandKind::Button },
    CommandDescriptor { id: "startDaydream", name: "Start daydream", kind: CommandKind::Button },
    CommandDescriptor { id: "startScreensaver", name: "Start screensaver", kind: CommandKind::Button },
    CommandDescriptor { id: "stopDaydream", name: "Stop daydream", kind: CommandKind::Button },
    CommandDescriptor { id: "stopScreensaver", name: "Stop screensaver", kind: CommandKind::Button },
    CommandDescriptor { id: "toBackground", name: "Send app to background", kind: CommandKind::Button },
    CommandDescriptor { id: "toForeground", name: "Bring app to foreground", kind: CommandKind::Button },
    CommandDescriptor { id: "triggerMotion", name: "Trigger motion", kind: CommandKind::Button },
    CommandDescriptor { id: "loadURL", name: "Load URL", kind: CommandKind::Text },
    CommandDescriptor { id: "setStringSetting", name: "Set string setting", kind: CommandKind::Text },
    CommandDescriptor { id: "startApplication", name: "Start application", kind: CommandKind::Text },
    CommandDescriptor { id: "textToSpeech", name: "Text to speech", kind: CommandKind::Text },
    CommandDescriptor { id: "screenBrightness", name: "Screen brightness", kind: CommandKind::Number },
    CommandDescriptor { id: "setAudioVolume", name: "Audio volume", kind: CommandKind::Number },
];

/// Event names devices are known to emit on the push channel.
pub const KNOWN_EVENTS: &[&str] = &[
    "background",
    "foreground",
    "screenOn",
    "screenOff",
    "pluggedAC",
    "pluggedUSB",
    "pluggedWireless",
    "unplugged",
    "networkReconnect",
    "networkDisconnect",
    "internetReconnect",
    "internetDisconnect",
    "powerOn",
    "powerOff",
    "showKeyboard",
    "hideKeyboard",
    "onMotion",
    "onDarkness",
    "onMovement",
    "volumeUp",
    "volumeDown",
    "onQrScanCancelled",
    "onBatteryLevelChanged",
    "onScreensaverStart",
    "onScreensaverStop",
    "onDaydreamStart",
    "onDaydreamStop",
    "onItemPlay",
    "onPlaylistPlay",
    "facesDetected",
];

pub fn switch_by_id(id: &str) -> Option<&'static SwitchPairDescriptor> {
    SWITCHES.iter().find(|s| s.id == id)
}

pub fn command_by_id(id: &str) -> Option<&'static CommandDescriptor> {
    COMMANDS.iter().find(|c| c.id == id)
}

/// Resolve a push-channel event into a switch confirmation.
///
/// On-names are checked before off-names across the whole table, so an event
/// serving as both is read as the on transition.
pub fn switch_confirmation(event: &str) -> Option<(&'static SwitchPairDescriptor, bool)> {
    if let Some(switch) = SWITCHES.iter().find(|s| s.event_on == Some(event)) {
        return Some((switch, true));
    }
    SWITCHES
        .iter()
        .find(|s| s.event_off == Some(event))
        .map(|s| (s, false))
}
