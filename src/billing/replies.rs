use chrono::{DateTime, Utc};

use super::catalog::{Tariff, TariffCatalog};
use super::models::Grant;
use super::query::{CheckCount, PaymentHistoryEntry, SubscriptionView};

/// Number of payments listed by the `/history` chat command.
pub const HISTORY_REPLY_LIMIT: i64 = 10;

/// key: chat-locale -> language of bot replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locale {
    En,
    Ru,
}

impl Locale {
    /// Maps a Telegram `language_code`; everything that is not Russian gets English.
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some(code) if code.trim().to_ascii_lowercase().starts_with("ru") => Locale::Ru,
            _ => Locale::En,
        }
    }

    fn is_ru(self) -> bool {
        self == Locale::Ru
    }

    fn format_time(self, at: DateTime<Utc>) -> String {
        match self {
            Locale::Ru => at.format("%d.%m.%Y %H:%M UTC").to_string(),
            Locale::En => at.format("%Y-%m-%d %H:%M UTC").to_string(),
        }
    }

    fn checks(self, count: CheckCount) -> String {
        match (count, self) {
            (CheckCount::Unlimited, Locale::Ru) => "Безлимит".to_string(),
            (CheckCount::Unlimited, Locale::En) => "Unlimited".to_string(),
            (CheckCount::Limited(count), _) => count.to_string(),
        }
    }
}

// Replies go out with parse_mode HTML.
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn welcome(locale: Locale, first_name: Option<&str>) -> String {
    let name = escape(first_name.unwrap_or_default().trim());
    let greeting = match (locale, name.is_empty()) {
        (Locale::Ru, true) => "👋 Привет!".to_string(),
        (Locale::Ru, false) => format!("👋 Привет, {name}!"),
        (Locale::En, true) => "👋 Hello!".to_string(),
        (Locale::En, false) => format!("👋 Hello, {name}!"),
    };
    if locale.is_ru() {
        format!(
            "{greeting}\n\nДобро пожаловать в DV-Lottery Photo Checker!\n\n🎯 Доступные команды:\n/tariffs - Просмотр и покупка тарифов\n/myplan - Информация о вашей подписке\n/history - История платежей"
        )
    } else {
        format!(
            "{greeting}\n\nWelcome to DV-Lottery Photo Checker!\n\n🎯 Available commands:\n/tariffs - View and buy tariffs\n/myplan - Your subscription info\n/history - Payment history"
        )
    }
}

pub fn tariff_list(locale: Locale, catalog: &TariffCatalog) -> String {
    let mut text = if locale.is_ru() {
        "💳 <b>ДОСТУПНЫЕ ТАРИФЫ</b>\n\n".to_string()
    } else {
        "💳 <b>AVAILABLE TARIFFS</b>\n\n".to_string()
    };
    for tariff in catalog.tariffs() {
        text.push_str(&format!(
            "✨ <b>{}</b> ({} ⭐)\n{}\n\n",
            escape(tariff.display_name(locale)),
            tariff.price,
            escape(tariff.display_description(locale)),
        ));
    }
    text.trim_end().to_string()
}

pub fn unknown_user(locale: Locale) -> String {
    match locale {
        Locale::Ru => "❌ Пользователь не найден".to_string(),
        Locale::En => "❌ User not found".to_string(),
    }
}

/// `/myplan` reply for the grant currently in use, or the "no subscription" hint.
pub fn subscription(
    locale: Locale,
    catalog: &TariffCatalog,
    plan: Option<&SubscriptionView>,
    now: DateTime<Utc>,
) -> String {
    let Some(plan) = plan else {
        return match locale {
            Locale::Ru => {
                "📭 У вас нет активной подписки.\n\nИспользуйте /tariffs для покупки тарифа."
                    .to_string()
            }
            Locale::En => "📭 You have no active subscription.\n\nUse /tariffs to buy a plan."
                .to_string(),
        };
    };

    let name = catalog
        .lookup(&plan.tariff_code)
        .map(|tariff| tariff.display_name(locale))
        .unwrap_or(plan.tariff_code.as_str());
    let checks = locale.checks(plan.checks_remaining);
    let validity = match plan.expires_at {
        Some(expires_at) => {
            let hours = hours_left(expires_at, now);
            match locale {
                Locale::Ru => format!(
                    "⏰ Истекает: <b>{}</b>\n⌛ Осталось: <b>{hours} часов</b>",
                    locale.format_time(expires_at)
                ),
                Locale::En => format!(
                    "⏰ Expires: <b>{}</b>\n⌛ Time left: <b>{hours} hours</b>",
                    locale.format_time(expires_at)
                ),
            }
        }
        None => match locale {
            Locale::Ru => "⏰ Действителен: <b>Постоянно</b>".to_string(),
            Locale::En => "⏰ Valid: <b>Permanently</b>".to_string(),
        },
    };
    let purchased = locale.format_time(plan.purchased_at);

    match locale {
        Locale::Ru => format!(
            "📊 <b>Ваша подписка</b>\n\n💳 Тариф: <b>{}</b>\n📦 Проверок осталось: <b>{checks}</b>\n{validity}\n📅 Куплен: {purchased}",
            escape(name)
        ),
        Locale::En => format!(
            "📊 <b>Your Subscription</b>\n\n💳 Tariff: <b>{}</b>\n📦 Checks left: <b>{checks}</b>\n{validity}\n📅 Purchased: {purchased}",
            escape(name)
        ),
    }
}

/// Whole hours until `expires_at`, rounded up.
fn hours_left(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (expires_at - now).num_seconds().max(0);
    (seconds + 3_599) / 3_600
}

pub fn history(locale: Locale, entries: &[PaymentHistoryEntry]) -> String {
    if entries.is_empty() {
        return match locale {
            Locale::Ru => "📭 История платежей пуста".to_string(),
            Locale::En => "📭 No payment history".to_string(),
        };
    }

    let mut text = if locale.is_ru() {
        "📜 <b>История платежей</b>\n\n".to_string()
    } else {
        "📜 <b>Payment History</b>\n\n".to_string()
    };
    for (index, entry) in entries.iter().enumerate() {
        text.push_str(&format!(
            "{}. {} • {} ⭐\n   📅 {}\n   ID: <code>{}</code>\n\n",
            index + 1,
            escape(&entry.tariff_code),
            entry.amount,
            locale.format_time(entry.recorded_at),
            escape(&entry.transaction_id),
        ));
    }
    text.trim_end().to_string()
}

/// Sent to the payer when a confirmed payment could not be applied.
pub fn payment_failed(locale: Locale) -> String {
    match locale {
        Locale::Ru => {
            "❌ Ошибка при обработке платежа. Пожалуйста, обратитесь в поддержку.".to_string()
        }
        Locale::En => "❌ Error processing payment. Please contact support.".to_string(),
    }
}

pub fn command_failed(locale: Locale) -> String {
    match locale {
        Locale::Ru => "❌ Ошибка".to_string(),
        Locale::En => "❌ Error".to_string(),
    }
}

pub fn activation(locale: Locale, tariff: &Tariff, amount: i64, grant: &Grant) -> String {
    let checks = if grant.unlimited {
        locale.checks(CheckCount::Unlimited)
    } else {
        locale.checks(CheckCount::Limited(grant.checks_limit))
    };
    let validity = match (grant.expires_at, locale) {
        (Some(at), Locale::Ru) => format!("⏰ Действует до: {}", locale.format_time(at)),
        (Some(at), Locale::En) => format!("⏰ Valid until: {}", locale.format_time(at)),
        (None, Locale::Ru) => "⏰ Действует: бессрочно".to_string(),
        (None, Locale::En) => "⏰ Valid: permanently".to_string(),
    };
    let name = escape(tariff.display_name(locale));

    match locale {
        Locale::Ru => format!(
            "✅ <b>Платеж успешно обработан!</b>\n\n💳 Тариф: <b>{name}</b>\n💫 Цена: {amount} ⭐\n📦 Проверок: {checks}\n{validity}"
        ),
        Locale::En => format!(
            "✅ <b>Payment processed successfully!</b>\n\n💳 Tariff: <b>{name}</b>\n💫 Price: {amount} ⭐\n📦 Checks: {checks}\n{validity}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::GrantStatus;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn grant(unlimited: bool) -> Grant {
        Grant {
            id: 1,
            user_id: 5,
            tariff_code: "MAX".to_string(),
            unlimited,
            checks_limit: 10,
            checks_remaining: 10,
            purchased_at: at(12),
            expires_at: Some(Utc.with_ymd_and_hms(2024, 5, 3, 12, 0, 0).unwrap()),
            transaction_id: "tx".to_string(),
            status: GrantStatus::Active,
        }
    }

    #[test]
    fn locale_defaults_to_english() {
        assert_eq!(Locale::from_code(Some("ru")), Locale::Ru);
        assert_eq!(Locale::from_code(Some("ru-RU")), Locale::Ru);
        assert_eq!(Locale::from_code(Some("uk")), Locale::En);
        assert_eq!(Locale::from_code(None), Locale::En);
    }

    #[test]
    fn activation_message_uses_localized_tariff_name() {
        let catalog = TariffCatalog::builtin();
        let tariff = catalog.lookup("MAX").unwrap();

        let en = activation(Locale::En, tariff, 1, &grant(true));
        assert!(en.contains("Tariff: <b>MAX</b>"));
        assert!(en.contains("Checks: Unlimited"));
        assert!(en.contains("Valid until: 2024-05-03 12:00 UTC"));

        let ru = activation(Locale::Ru, tariff, 1, &grant(false));
        assert!(ru.contains("Тариф: <b>МАКС</b>"));
        assert!(ru.contains("Проверок: 10"));
        assert!(ru.contains("03.05.2024"));

        let lite = catalog.lookup("LITE").unwrap();
        assert!(activation(Locale::Ru, lite, 1, &grant(false)).contains("ЛАЙТ"));
    }

    #[test]
    fn tariff_list_shows_every_plan() {
        let catalog = TariffCatalog::builtin();
        let ru = tariff_list(Locale::Ru, &catalog);
        assert!(ru.starts_with("💳 <b>ДОСТУПНЫЕ ТАРИФЫ</b>"));
        assert!(ru.contains("✨ <b>УЛЬТРА</b> (1 ⭐)\nБезлимитные проверки на 6 месяцев"));

        let en = tariff_list(Locale::En, &catalog);
        assert!(en.contains("✨ <b>LITE</b> (1 ⭐)\n10 photo checks"));
        assert_eq!(en.matches("✨").count(), 3);
    }

    #[test]
    fn subscription_reports_hours_left_rounded_up() {
        let catalog = TariffCatalog::builtin();
        let view = SubscriptionView::from(&grant(true));
        let now = at(12) + Duration::minutes(30);

        let en = subscription(Locale::En, &catalog, Some(&view), now);
        assert!(en.contains("Checks left: <b>Unlimited</b>"));
        // 47.5 hours remain
        assert!(en.contains("Time left: <b>48 hours</b>"));
        assert!(en.contains("Purchased: 2024-05-01 12:00 UTC"));

        let none = subscription(Locale::Ru, &catalog, None, now);
        assert!(none.starts_with("📭 У вас нет активной подписки."));
    }

    #[test]
    fn permanent_plans_have_no_countdown() {
        let catalog = TariffCatalog::builtin();
        let mut lite = grant(false);
        lite.tariff_code = "LITE".to_string();
        lite.expires_at = None;
        lite.checks_remaining = 7;

        let ru = subscription(Locale::Ru, &catalog, Some(&SubscriptionView::from(&lite)), at(13));
        assert!(ru.contains("Тариф: <b>ЛАЙТ</b>"));
        assert!(ru.contains("Проверок осталось: <b>7</b>"));
        assert!(ru.contains("Постоянно"));
        assert!(!ru.contains("Осталось:"));
    }

    #[test]
    fn history_lists_entries_in_given_order() {
        let entries = vec![
            PaymentHistoryEntry {
                tariff_code: "MAX".to_string(),
                amount: 1,
                currency: "XTR".to_string(),
                transaction_id: "charge-2".to_string(),
                recorded_at: at(14),
            },
            PaymentHistoryEntry {
                tariff_code: "LITE".to_string(),
                amount: 1,
                currency: "XTR".to_string(),
                transaction_id: "charge-1".to_string(),
                recorded_at: at(9),
            },
        ];

        let en = history(Locale::En, &entries);
        assert!(en.starts_with("📜 <b>Payment History</b>"));
        assert!(en.contains("1. MAX • 1 ⭐\n   📅 2024-05-01 14:00 UTC\n   ID: <code>charge-2</code>"));
        assert!(en.contains("2. LITE • 1 ⭐"));

        assert_eq!(history(Locale::Ru, &[]), "📭 История платежей пуста");
    }

    #[test]
    fn user_text_is_escaped() {
        let text = welcome(Locale::En, Some("<b>Eve</b> & co"));
        assert!(text.starts_with("👋 Hello, &lt;b&gt;Eve&lt;/b&gt; &amp; co!"));
        assert!(welcome(Locale::Ru, None).starts_with("👋 Привет!"));
    }
}
