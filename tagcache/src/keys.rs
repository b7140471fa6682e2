//! Store key layout.
//!
//! ```text
//! {TypeName}:{key}                      cached entry (see `qualified_key`)
//! {root}:_cacheKeysByTag:{tag}          set of keys carrying `tag`
//! {root}:_cacheTagsByKey:{key}          set of tags carried by `key`
//! {root}:_cacheExpiryKeys               sorted set, score = expiry rank
//! ```

/// Default root namespace.
pub const DEFAULT_ROOT_NAMESPACE: &str = "_redisCache";

const KEYS_BY_TAG_SEGMENT: &str = "_cacheKeysByTag";
const TAGS_BY_KEY_SEGMENT: &str = "_cacheTagsByKey";
const EXPIRY_SEGMENT: &str = "_cacheExpiryKeys";

/// Builds and parses the Store keys used by the secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    root: String,
}

impl KeySpace {
    /// Create a key space under the given root namespace.
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// The root namespace.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Reverse-index key: the set of keys tagged with `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> String {
        format!("{}{}", self.keys_for_tag_prefix(), tag)
    }

    /// Forward-index key: the set of tags carried by `key`.
    pub fn tags_for_key(&self, key: &str) -> String {
        format!("{}{}", self.tags_for_key_prefix(), key)
    }

    /// Key of the expiry schedule.
    pub fn expiry_schedule(&self) -> String {
        format!("{}:{}", self.root, EXPIRY_SEGMENT)
    }

    /// Scan pattern matching every reverse-index key.
    pub fn keys_for_tag_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.keys_for_tag_prefix()))
    }

    /// Scan pattern matching every forward-index key.
    pub fn tags_for_key_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.tags_for_key_prefix()))
    }

    /// Recover the tag from a reverse-index key.
    pub fn tag_from_index_key<'a>(&self, index_key: &'a str) -> Option<&'a str> {
        index_key
            .strip_prefix(&self.keys_for_tag_prefix())
            .filter(|tag| !tag.is_empty())
    }

    /// Recover the cache key from a forward-index key.
    pub fn key_from_index_key<'a>(&self, index_key: &'a str) -> Option<&'a str> {
        index_key
            .strip_prefix(&self.tags_for_key_prefix())
            .filter(|key| !key.is_empty())
    }

    fn keys_for_tag_prefix(&self) -> String {
        format!("{}:{}:", self.root, KEYS_BY_TAG_SEGMENT)
    }

    fn tags_for_key_prefix(&self) -> String {
        format!("{}:{}:", self.root, TAGS_BY_KEY_SEGMENT)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_NAMESPACE)
    }
}

/// Qualify a logical key with the short name of `T`, e.g. `User:42`.
///
/// Values of different types stored under the same logical key do not
/// collide.
pub fn qualified_key<T: ?Sized>(key: &str) -> String {
    format!("{}:{}", type_discriminator::<T>(), key)
}

/// Short type name with module paths stripped: `Vec<my::User>` -> `Vec<User>`.
pub fn type_discriminator<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();

    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            segment.push(c);
        } else {
            out.push_str(segment.rsplit("::").next().unwrap_or(&segment));
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(segment.rsplit("::").next().unwrap_or(&segment));
    out
}

/// Escape glob metacharacters so a literal prefix can be used in `SCAN MATCH`.
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Redis-style glob match supporting `*`, `?`, `[...]` classes and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    let Some((&first, rest)) = pattern.split_first() else {
        return text.is_empty();
    };

    match first {
        '*' => (0..=text.len()).any(|skip| glob_match_at(rest, &text[skip..])),
        '?' => !text.is_empty() && glob_match_at(rest, &text[1..]),
        '\\' => match rest.split_first() {
            Some((&literal, rest)) => {
                text.first() == Some(&literal) && glob_match_at(rest, &text[1..])
            }
            None => text == ['\\'],
        },
        '[' => {
            let Some(close) = rest.iter().position(|&c| c == ']') else {
                return text.first() == Some(&'[') && glob_match_at(rest, &text[1..]);
            };
            let Some(&c) = text.first() else {
                return false;
            };
            let (negated, class) = match rest[..close].split_first() {
                Some(('^', class)) => (true, class),
                _ => (false, &rest[..close]),
            };
            let mut hit = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == '-' {
                    hit |= class[i] <= c && c <= class[i + 2];
                    i += 3;
                } else {
                    hit |= class[i] == c;
                    i += 1;
                }
            }
            hit != negated && glob_match_at(&rest[close + 1..], &text[1..])
        }
        literal => text.first() == Some(&literal) && glob_match_at(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct User;

    #[test]
    fn test_index_keys() {
        let keys = KeySpace::default();
        assert_eq!(keys.keys_for_tag("vip"), "_redisCache:_cacheKeysByTag:vip");
        assert_eq!(keys.tags_for_key("User:42"), "_redisCache:_cacheTagsByKey:User:42");
        assert_eq!(keys.expiry_schedule(), "_redisCache:_cacheExpiryKeys");
    }

    #[test]
    fn test_index_keys_parse_back_with_colons() {
        let keys = KeySpace::new("app");
        let index = keys.tags_for_key("User:42:profile");
        assert_eq!(keys.key_from_index_key(&index), Some("User:42:profile"));

        let index = keys.keys_for_tag("region:eu");
        assert_eq!(keys.tag_from_index_key(&index), Some("region:eu"));
        assert_eq!(keys.tag_from_index_key("other:thing"), None);
    }

    #[test]
    fn test_patterns_escape_root() {
        let keys = KeySpace::new("tenant[1]");
        let pattern = keys.keys_for_tag_pattern();
        assert_eq!(pattern, "tenant\\[1\\]:_cacheKeysByTag:*");
        assert!(glob_match(&pattern, &keys.keys_for_tag("x")));
        assert!(!glob_match(&pattern, "tenant1:_cacheKeysByTag:x"));
    }

    #[test]
    fn test_qualified_key() {
        assert_eq!(qualified_key::<User>("42"), "User:42");
        assert_eq!(qualified_key::<String>("a"), "String:a");
        assert_eq!(type_discriminator::<Vec<User>>(), "Vec<User>");
        assert_eq!(
            type_discriminator::<std::collections::HashMap<String, u32>>(),
            "HashMap<String, u32>"
        );
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("a*c", "abbbc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("h[ae]llo", "hello"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("k[a-c]", "kb"));
        assert!(glob_match("\\*", "*"));
        assert!(!glob_match("\\*", "x"));
        assert!(glob_match("*:expired", "__keyevent@0__:expired"));
    }
}
