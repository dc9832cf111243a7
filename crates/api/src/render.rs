//! Rendering of engine replies into LINE messages

use quotagate_billing::{ApologyReason, Reply};
use quotagate_shared::PlanTier;
use serde_json::{json, Value};

use crate::line::LineMessage;

pub const FREE_PLAN_NOTICE: &str =
    "現在無料プランをご利用中です。有料プランに登録すると契約管理ページをご利用いただけます。";
pub const PORTAL_FAILED: &str =
    "契約管理ページの生成に失敗しました。しばらく経ってから再度お試しください。";
pub const CHECKOUT_INTRO: &str = "以下のリンクから有料プランにご登録ください：";
pub const PORTAL_INTRO: &str = "以下のリンクから契約状況の確認・変更ができます：";
pub const APOLOGY_OVERLOADED: &str =
    "ただいまサーバーが混雑しています。少し時間をおいてから再度お試しください。";
pub const APOLOGY_ANSWER_FAILED: &str = "AIの処理でエラーが発生しました。しばらくお待ちください。";
pub const APOLOGY_GENERAL: &str = "エラーが発生しました。しばらく経ってから再度お試しください。";
pub const LINK_UNAVAILABLE: &str =
    "リンクの生成に失敗しました。しばらく経ってから再度お試しください。";

/// LINE rejects text messages longer than this many characters.
const MAX_TEXT_CHARS: usize = 5000;

const MONTHLY_COLOR: &str = "#06C755";
const YEARLY_COLOR: &str = "#FF9800";

fn plan_label(plan: PlanTier) -> &'static str {
    match plan {
        PlanTier::Free => "無料プラン",
        PlanTier::Monthly => "月額プラン",
        PlanTier::Yearly => "年額プラン",
    }
}

fn plan_price(plan: PlanTier) -> &'static str {
    match plan {
        PlanTier::Free => "0円",
        PlanTier::Monthly => "990円/月（税込）",
        PlanTier::Yearly => "9,900円/年（税込）",
    }
}

fn truncate(text: String) -> String {
    if text.chars().count() <= MAX_TEXT_CHARS {
        return text;
    }
    text.chars().take(MAX_TEXT_CHARS).collect()
}

fn uri_button(label: &str, uri: &str, color: &str, style: &str) -> Value {
    json!({
        "type": "button",
        "action": {"type": "uri", "label": label, "uri": uri},
        "style": style,
        "color": color,
        "height": "md"
    })
}

/// Builds LINE messages for engine replies.
#[derive(Debug, Clone)]
pub struct Renderer {
    upgrade_page_url: String,
}

impl Renderer {
    pub fn new(upgrade_page_url: impl Into<String>) -> Self {
        Self {
            upgrade_page_url: upgrade_page_url.into(),
        }
    }

    /// Plan landing page URL for `plan`
    pub fn upgrade_url(&self, plan: PlanTier) -> String {
        let separator = if self.upgrade_page_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!("{}{}plan={}", self.upgrade_page_url, separator, plan)
    }

    pub fn render_all(&self, replies: &[Reply]) -> Vec<LineMessage> {
        replies.iter().flat_map(|r| self.render(r)).collect()
    }

    pub fn render(&self, reply: &Reply) -> Vec<LineMessage> {
        match reply {
            Reply::Answer(text) => vec![LineMessage::text(truncate(text.clone()))],
            Reply::Welcome {
                display_name,
                quota_limit,
            } => vec![LineMessage::text(format!(
                "{}さん、トリマーAIボットへようこそ！\n\nトリミングに関するご質問をお気軽にお送りください。\n\n📊 無料プラン: 月{}回まで\n⭐ 有料プラン: 無制限でご利用可能\n\nメニューから有料プランへの登録や契約状況の確認ができます。",
                display_name, quota_limit
            ))],
            Reply::UpgradeOffer { quota_limit } => vec![self.upgrade_offer(*quota_limit)],
            Reply::QuotaRemaining { remaining } => vec![LineMessage::text(format!(
                "📝 今月の残り利用回数: {}回",
                remaining
            ))],
            Reply::Apology(ApologyReason::Overloaded) => {
                vec![LineMessage::text(APOLOGY_OVERLOADED)]
            }
            Reply::Apology(ApologyReason::AnswerFailed) => {
                vec![LineMessage::text(APOLOGY_ANSWER_FAILED)]
            }
            Reply::Apology(ApologyReason::Unavailable) => vec![LineMessage::text(APOLOGY_GENERAL)],
            Reply::CheckoutLink { url } => vec![
                LineMessage::text(CHECKOUT_INTRO),
                LineMessage::text(url.clone()),
            ],
            Reply::PortalLink { url } => vec![
                LineMessage::text(PORTAL_INTRO),
                LineMessage::text(url.clone()),
            ],
            Reply::FreePlanNotice => vec![LineMessage::text(FREE_PLAN_NOTICE)],
            Reply::PlanMenu { quota_limit } => vec![self.plan_menu(*quota_limit)],
            Reply::PlanStatus {
                plan,
                portal_url,
                switch_plan,
            } => vec![self.plan_status(*plan, portal_url.as_deref(), switch_plan.as_ref())],
            Reply::LinkUnavailable => vec![LineMessage::text(LINK_UNAVAILABLE)],
        }
    }

    fn plan_choices(&self) -> Vec<Value> {
        vec![
            json!({
                "type": "box",
                "layout": "vertical",
                "backgroundColor": "#f8f8f8",
                "cornerRadius": "md",
                "paddingAll": "lg",
                "contents": [
                    {"type": "text", "text": plan_label(PlanTier::Monthly), "weight": "bold", "size": "lg"},
                    {"type": "text", "text": plan_price(PlanTier::Monthly), "color": MONTHLY_COLOR, "margin": "sm"},
                    {"type": "text", "text": "いつでも解約可能", "size": "sm", "color": "#666666"}
                ]
            }),
            uri_button(
                "月額プランで登録",
                &self.upgrade_url(PlanTier::Monthly),
                MONTHLY_COLOR,
                "primary",
            ),
            json!({"type": "separator", "margin": "lg"}),
            json!({
                "type": "box",
                "layout": "vertical",
                "backgroundColor": "#fff8e1",
                "cornerRadius": "md",
                "paddingAll": "lg",
                "contents": [
                    {"type": "text", "text": plan_label(PlanTier::Yearly), "weight": "bold", "size": "lg"},
                    {"type": "text", "text": plan_price(PlanTier::Yearly), "color": YEARLY_COLOR, "margin": "sm", "weight": "bold"},
                    {"type": "text", "text": "月額プランより2ヶ月分お得", "size": "sm", "color": "#666666"}
                ]
            }),
            uri_button(
                "年額プランで登録",
                &self.upgrade_url(PlanTier::Yearly),
                YEARLY_COLOR,
                "primary",
            ),
        ]
    }

    fn upgrade_offer(&self, quota_limit: u32) -> LineMessage {
        let mut body = vec![
            json!({
                "type": "text",
                "text": format!("今月の無料利用回数（{}回）を使い切りました", quota_limit),
                "weight": "bold",
                "wrap": true
            }),
            json!({
                "type": "text",
                "text": "有料プランに登録すると、無制限でご利用いただけます",
                "size": "sm",
                "color": "#666666",
                "wrap": true
            }),
            json!({"type": "separator", "margin": "lg"}),
        ];
        body.extend(self.plan_choices());

        LineMessage::Flex {
            alt_text: "利用回数制限のお知らせ".to_string(),
            contents: json!({
                "type": "bubble",
                "header": {
                    "type": "box",
                    "layout": "vertical",
                    "backgroundColor": "#FFF3E0",
                    "contents": [{
                        "type": "text",
                        "text": "⚠️ 利用回数制限",
                        "weight": "bold",
                        "size": "lg",
                        "align": "center",
                        "color": "#E65100"
                    }]
                },
                "body": {"type": "box", "layout": "vertical", "spacing": "md", "contents": body}
            }),
        }
    }

    fn plan_menu(&self, quota_limit: u32) -> LineMessage {
        LineMessage::Flex {
            alt_text: "プラン選択".to_string(),
            contents: json!({
                "type": "bubble",
                "header": {
                    "type": "box",
                    "layout": "vertical",
                    "contents": [{
                        "type": "text",
                        "text": "プランを選択してください",
                        "weight": "bold",
                        "size": "lg",
                        "align": "center"
                    }]
                },
                "body": {
                    "type": "box",
                    "layout": "vertical",
                    "spacing": "md",
                    "contents": self.plan_choices()
                },
                "footer": {
                    "type": "box",
                    "layout": "vertical",
                    "contents": [{
                        "type": "text",
                        "text": format!("※無料プランは月{}回まで利用可能", quota_limit),
                        "size": "xs",
                        "color": "#999999",
                        "align": "center"
                    }]
                }
            }),
        }
    }

    fn plan_status(
        &self,
        plan: PlanTier,
        portal_url: Option<&str>,
        switch_plan: Option<&(PlanTier, String)>,
    ) -> LineMessage {
        let mut body = vec![
            json!({"type": "text", "text": "現在のプラン", "weight": "bold", "size": "sm", "color": "#666666"}),
            json!({
                "type": "box",
                "layout": "horizontal",
                "margin": "sm",
                "contents": [
                    {"type": "text", "text": plan_label(plan), "weight": "bold", "size": "xl", "color": MONTHLY_COLOR, "flex": 0},
                    {"type": "text", "text": plan_price(plan), "margin": "md", "flex": 0, "gravity": "bottom"}
                ]
            }),
        ];

        if let Some((target, url)) = switch_plan {
            let (label, color) = match target {
                PlanTier::Yearly => ("年額プランに変更（2ヶ月分お得！）", YEARLY_COLOR),
                _ => ("月額プランに変更", MONTHLY_COLOR),
            };
            body.push(json!({"type": "separator", "margin": "lg"}));
            body.push(json!({"type": "text", "text": "プラン変更", "weight": "bold", "margin": "lg"}));
            body.push(uri_button(label, url, color, "secondary"));
        }

        body.push(json!({"type": "separator", "margin": "lg"}));
        match portal_url {
            Some(url) => {
                body.push(uri_button("契約管理ページ", url, "#4169E1", "secondary"));
                body.push(json!({
                    "type": "text",
                    "text": "※支払い方法変更・請求書確認・解約",
                    "size": "xs",
                    "color": "#999999",
                    "align": "center"
                }));
            }
            None => body.push(json!({"type": "text", "text": PORTAL_FAILED, "size": "sm", "wrap": true})),
        }

        LineMessage::Flex {
            alt_text: "契約状況".to_string(),
            contents: json!({
                "type": "bubble",
                "body": {"type": "box", "layout": "vertical", "contents": body}
            }),
        }
    }
}
