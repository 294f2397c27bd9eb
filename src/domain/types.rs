//! Enumerations persisted as text columns.

use serde::{Deserialize, Serialize};

/// A closed set of text values stored in one column.
pub trait TextEnum: Sized + Copy {
    fn parse(text: &str) -> Option<Self>;

    /// Accepted spellings, for validation messages.
    fn allowed() -> String;
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl TextEnum for $name {
            fn parse(text: &str) -> Option<Self> {
                Self::try_from(text).ok()
            }

            fn allowed() -> String {
                Self::ALL
                    .iter()
                    .map(|value| value.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ();

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                match value {
                    $($text => Ok($name::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

text_enum!(
    /// Editorial state of an article.
    ArticleStatus {
        Draft => "draft",
        Published => "published",
        Archived => "archived",
    }
);

text_enum!(ArticleCategory {
    News => "news",
    Events => "events",
    Tips => "tips",
    General => "general",
});

text_enum!(
    /// Network an embedded social post comes from.
    SocialPlatform {
        Instagram => "instagram",
        Facebook => "facebook",
        Tiktok => "tiktok",
        Youtube => "youtube",
        Twitter => "twitter",
    }
);

text_enum!(
    /// Whether the day's lessons go ahead.
    LessonState {
        Running => "running",
        Cancelled => "cancelled",
        Delayed => "delayed",
        Tentative => "tentative",
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trips() {
        for status in ArticleStatus::ALL {
            assert_eq!(ArticleStatus::try_from(status.as_str()), Ok(*status));
        }
        assert!(SocialPlatform::try_from("myspace").is_err());
    }

    #[test]
    fn allowed_lists_every_variant() {
        assert_eq!(
            LessonState::allowed(),
            "running, cancelled, delayed, tentative"
        );
    }
}
