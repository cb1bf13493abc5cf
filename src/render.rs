//! Message text for a transaction and the digest used to detect changes.
//!
//! Output is Telegram HTML. Both functions are pure: the same transaction
//! always renders to the same text and hashes to the same digest.

use sha2::{Digest, Sha256};

use crate::model::{RemoteTxn, UserSession};

/// Marks a reviewed transaction without visible text.
const REVIEWED_MARK: char = '\u{200b}';
const UNREVIEWED_MARK: char = '\u{200c}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Render category, group and account names as hashtags.
    pub tagging: bool,
    /// Include the authorization time when the provider reports one.
    pub show_datetime: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            tagging: true,
            show_datetime: true,
        }
    }
}

impl From<&UserSession> for RenderOptions {
    fn from(session: &UserSession) -> Self {
        Self {
            tagging: session.tagging,
            show_datetime: session.show_datetime,
        }
    }
}

pub fn render_transaction(txn: &RemoteTxn, opts: &RenderOptions) -> String {
    let watermark = if txn.reviewed {
        REVIEWED_MARK
    } else {
        UNREVIEWED_MARK
    };
    let mut header = format!("<b>{}</b> {}", escape_html(&txn.payee), watermark);
    if txn.recurring {
        header.push_str(" (recurring 🔄)");
    }
    if txn.is_pending {
        header.push_str(" (pending ⏳)");
    }

    let sign = if txn.amount < 0.0 { "➕" } else { "" };
    let mut out = format!("{}\n\n", header);
    out.push_str(&format!(
        "<b>Amount</b>: <code>{}{}</code> <code>{}</code>\n",
        sign,
        format_amount(txn.amount.abs()),
        escape_html(&txn.currency.to_uppercase())
    ));
    out.push_str(&format!("<b>Date/Time</b>: {}\n", format_when(txn, opts)));

    let group = txn
        .category_group_name
        .as_deref()
        .map(|g| format!("{} / ", label(g, opts.tagging)))
        .unwrap_or_default();
    let category = txn.category_name.as_deref().unwrap_or("Uncategorized");
    out.push_str(&format!(
        "<b>Category</b>: {}{}\n",
        group,
        label(category, opts.tagging)
    ));

    let account = txn
        .account_name
        .as_deref()
        .filter(|a| !a.trim().is_empty())
        .unwrap_or("Unknown Account");
    out.push_str(&format!("<b>Account</b>: {}\n", label(account, opts.tagging)));

    if let Some(notes) = txn.notes.as_deref() {
        out.push_str(&format!("<b>Notes</b>: {}\n", escape_html(notes)));
    }
    if !txn.tags.is_empty() {
        let tags: Vec<String> = txn.tags.iter().map(|t| make_tag(t)).collect();
        out.push_str(&format!("<b>Tags</b>: {}\n", tags.join(", ")));
    }
    out
}

/// SHA-256 over the fields that affect how a transaction is rendered.
pub fn content_hash(txn: &RemoteTxn) -> String {
    let fields = [
        format!("{:.2}", txn.amount),
        txn.currency.to_lowercase(),
        txn.payee.clone(),
        txn.category_id.map(|c| c.to_string()).unwrap_or_default(),
        txn.category_name.clone().unwrap_or_default(),
        txn.category_group_name.clone().unwrap_or_default(),
        txn.account_name.clone().unwrap_or_default(),
        txn.notes.clone().unwrap_or_default(),
        txn.reviewed.to_string(),
        txn.is_pending.to_string(),
        txn.recurring.to_string(),
        txn.date.to_string(),
        txn.authorized_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
        txn.tags.join(","),
    ];
    let mut hasher = Sha256::new();
    for field in &fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

fn format_when(txn: &RemoteTxn, opts: &RenderOptions) -> String {
    match txn.authorized_at {
        Some(at) if opts.show_datetime => at.format("%a, %b %d at %I:%M %p UTC").to_string(),
        _ => txn.date.format("%a, %b %d").to_string(),
    }
}

/// `1234.5` -> `1,234.50`
fn format_amount(value: f64) -> String {
    let fixed = format!("{:.2}", value);
    let (int_part, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}.{}", grouped, frac)
}

fn label(name: &str, tagging: bool) -> String {
    if tagging {
        make_tag(name)
    } else {
        escape_html(name)
    }
}

/// `"coffee shops ☕"` -> `"☕ #CoffeeShops"`
fn make_tag(name: &str) -> String {
    let symbols: String = name
        .chars()
        .filter(|c| !c.is_ascii() && !c.is_alphanumeric() && !c.is_whitespace())
        .collect();
    let tag: String = name
        .split_whitespace()
        .map(|word| {
            let word: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect();
    if symbols.is_empty() {
        format!("#{}", tag)
    } else {
        format!("{} #{}", symbols, tag)
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn txn() -> RemoteTxn {
        RemoteTxn {
            id: 10,
            date: NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
            account_id: Some(1),
            account_name: Some("Main Checking".into()),
            amount: 1234.5,
            currency: "usd".into(),
            payee: "Joe's <Diner>".into(),
            category_id: Some(5),
            category_name: Some("coffee shops".into()),
            category_group_name: Some("Food".into()),
            notes: None,
            reviewed: false,
            is_pending: false,
            recurring: false,
            tags: vec![],
            merchant_name: None,
            authorized_at: None,
            plaid_id: None,
            pending_plaid_id: None,
        }
    }

    #[test]
    fn renders_core_fields() {
        let text = render_transaction(&txn(), &RenderOptions::default());
        assert!(text.starts_with("<b>Joe's &lt;Diner&gt;</b>"));
        assert!(text.contains("<code>1,234.50</code> <code>USD</code>"));
        assert!(text.contains("<b>Category</b>: #Food / #CoffeeShops"));
        assert!(text.contains("<b>Account</b>: #MainChecking"));
        assert!(text.contains("Fri, May 03"));
        assert!(text.contains(UNREVIEWED_MARK));
    }

    #[test]
    fn credit_and_plain_labels() {
        let mut t = txn();
        t.amount = -20.0;
        t.reviewed = true;
        t.notes = Some("refund".into());
        t.authorized_at = Some(Utc.with_ymd_and_hms(2024, 5, 3, 14, 5, 0).unwrap());
        let opts = RenderOptions {
            tagging: false,
            show_datetime: true,
        };
        let text = render_transaction(&t, &opts);
        assert!(text.contains("<code>➕20.00</code>"));
        assert!(text.contains("<b>Category</b>: Food / coffee shops"));
        assert!(text.contains("<b>Notes</b>: refund"));
        assert!(text.contains("at 02:05 PM UTC"));
        assert!(text.contains(REVIEWED_MARK));
    }

    #[test]
    fn hash_tracks_renderable_fields() {
        let base = txn();
        let h = content_hash(&base);
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash(&base.clone()));

        let mut recategorized = base.clone();
        recategorized.category_id = Some(6);
        assert_ne!(h, content_hash(&recategorized));

        let mut reviewed = base.clone();
        reviewed.reviewed = true;
        assert_ne!(h, content_hash(&reviewed));

        let mut moved = base.clone();
        moved.account_id = Some(2);
        moved.account_name = Some("Savings".into());
        assert_ne!(h, content_hash(&moved));

        let mut regrouped = base.clone();
        regrouped.category_group_name = Some("Dining".into());
        assert_ne!(h, content_hash(&regrouped));

        let mut recurring = base.clone();
        recurring.recurring = true;
        assert_ne!(h, content_hash(&recurring));

        let mut redated = base.clone();
        redated.date = redated.date.succ_opt().unwrap();
        assert_ne!(h, content_hash(&redated));

        let mut authorized = base.clone();
        authorized.authorized_at = Some(Utc.with_ymd_and_hms(2024, 5, 3, 18, 30, 0).unwrap());
        assert_ne!(h, content_hash(&authorized));

        // Not rendered, so not hashed.
        let mut merchant = base.clone();
        merchant.merchant_name = Some("Diner Inc".into());
        assert_eq!(h, content_hash(&merchant));
    }

    #[test]
    fn amount_grouping() {
        assert_eq!(format_amount(0.5), "0.50");
        assert_eq!(format_amount(999.0), "999.00");
        assert_eq!(format_amount(1_000_000.0), "1,000,000.00");
    }

    #[test]
    fn tags_keep_emoji_prefix() {
        assert_eq!(make_tag("coffee shops ☕"), "☕ #CoffeeShops");
        assert_eq!(make_tag("u.s. taxes"), "#UsTaxes");
    }
}
