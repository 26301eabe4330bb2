//! The moods a chat can start in.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mood {
    pub name: &'static str,
    pub emoji: &'static str,
    pub greeting: &'static str,
}

pub const MOODS: [Mood; 5] = [
    Mood {
        name: "Excited",
        emoji: "🔥",
        greeting: "YAY! Let's crush today! 🔥",
    },
    Mood {
        name: "Chill",
        emoji: "😎",
        greeting: "Perfect calm vibes. What's up? 😎",
    },
    Mood {
        name: "Focused",
        emoji: "🎯",
        greeting: "Locked in. Let's get productive. 🎯",
    },
    Mood {
        name: "Tired",
        emoji: "😴",
        greeting: "Take it easy. I'm right here for you. 😴",
    },
    Mood {
        name: "Curious",
        emoji: "🤔",
        greeting: "Ooh, I love curiosity! Ask me anything! 🤔",
    },
];

/// Case-insensitive lookup by name.
pub fn find_mood(name: &str) -> Option<&'static Mood> {
    MOODS
        .iter()
        .find(|m| m.name.eq_ignore_ascii_case(name.trim()))
}

pub fn mood_names() -> String {
    MOODS.iter().map(|m| m.name).collect::<Vec<_>>().join(", ")
}
