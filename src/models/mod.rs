mod billing;
mod click;
mod link;

pub use billing::{
    AccountPlan, BillingOption, BillingPlan, OptionValueError, PASSTHROUGH_OPTIONS, TIMEDATA_LIMIT,
    URL_LIMIT,
};
pub use click::ClickEvent;
pub use link::{Campaign, CampaignLink, CreateLinkRequest, Link, LinkFilter, Utm};
