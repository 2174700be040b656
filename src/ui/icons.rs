//! Console icons. Each degrades to ASCII on terminals without emoji support.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("\u{2705} ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("\u{274c} ", "[FAIL] ");
pub static SPARKLE: Emoji<'_, '_> = Emoji("\u{2728} ", "* ");
pub static WARN: Emoji<'_, '_> = Emoji("\u{26a0}\u{fe0f}  ", "[!] ");

pub static BRANCH: Emoji<'_, '_> = Emoji("\u{1f33f} ", "[B] ");
pub static RETRY: Emoji<'_, '_> = Emoji("\u{1f504} ", "[R] ");
pub static STOP: Emoji<'_, '_> = Emoji("\u{1f6d1} ", "[STOP] ");
pub static CLOCK: Emoji<'_, '_> = Emoji("\u{23f1}\u{fe0f}  ", "[T] ");
pub static LOCK: Emoji<'_, '_> = Emoji("\u{1f512} ", "[L] ");
