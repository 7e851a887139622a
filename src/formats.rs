/// How a finished file is handed back through the chat transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    Audio,
    Video,
}

/// A named quality/format target. The catalog is fixed at process start and
/// shared read-only by every request.
#[derive(Clone, Debug)]
pub struct FormatSpec {
    pub key: &'static str,
    pub selector: &'static str,
    pub container: &'static str,
    pub delivery: Delivery,
    /// Whether yt-dlp runs a postprocessing step (audio extraction), which makes
    /// the final path deterministic but delayed.
    pub postprocess: bool,
}

const CATALOG: &[FormatSpec] = &[
    FormatSpec {
        key: "mp3",
        selector: "bestaudio[ext=m4a]/bestaudio",
        container: "mp3",
        delivery: Delivery::Audio,
        postprocess: true,
    },
    FormatSpec {
        key: "144",
        selector: "bestvideo[height<=144]+bestaudio/best[height<=144]",
        container: "mp4",
        delivery: Delivery::Video,
        postprocess: false,
    },
    FormatSpec {
        key: "240",
        selector: "bestvideo[height<=240]+bestaudio/best[height<=240]",
        container: "mp4",
        delivery: Delivery::Video,
        postprocess: false,
    },
    FormatSpec {
        key: "360",
        selector: "bestvideo[height<=360]+bestaudio/best[height<=360]",
        container: "mp4",
        delivery: Delivery::Video,
        postprocess: false,
    },
    FormatSpec {
        key: "480",
        selector: "bestvideo[height<=480]+bestaudio/best[height<=480]",
        container: "mp4",
        delivery: Delivery::Video,
        postprocess: false,
    },
    FormatSpec {
        key: "720",
        selector: "bestvideo[height<=720]+bestaudio/best[height<=720]",
        container: "mp4",
        delivery: Delivery::Video,
        postprocess: false,
    },
    FormatSpec {
        key: "1080",
        selector: "bestvideo[height<=1080]+bestaudio/best[height<=1080]",
        container: "mp4",
        delivery: Delivery::Video,
        postprocess: false,
    },
];

pub fn catalog() -> &'static [FormatSpec] {
    CATALOG
}

pub fn lookup(key: &str) -> Option<&'static FormatSpec> {
    CATALOG.iter().find(|spec| spec.key == key)
}

pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let bytes_f = bytes as f64;
    if bytes_f >= GB {
        format!("{:.2} GB", bytes_f / GB)
    } else if bytes_f >= MB {
        format!("{:.1} MB", bytes_f / MB)
    } else if bytes_f >= KB {
        format!("{:.1} KB", bytes_f / KB)
    } else {
        format!("{bytes} B")
    }
}
